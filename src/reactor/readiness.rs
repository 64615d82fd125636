//! Readiness flags shared by every backend and every caller.
//!
//! The bit values follow the classic `poll(2)` layout so that flag sets can be
//! logged and compared against native traces without translation.
//!
//! | Flag | Bit | Name |
//! |------|-----|------|
//! | `NONE` | `0x00` | `POLL_NULL` |
//! | `READ` | `0x01` | `POLL_IN` |
//! | `WRITE` | `0x04` | `POLL_OUT` |
//! | `ERROR` | `0x08` | `POLL_ERR` |
//! | `HANGUP` | `0x10` | `POLL_HUP` |
//! | `INVALID` | `0x20` | `POLL_NVAL` |
//!
//! # Example
//!
//! ```
//! use muxloop::Readiness;
//!
//! let ready = Readiness::READ | Readiness::WRITE;
//! assert!(ready.is_readable());
//! assert!(ready.is_writable());
//! assert_eq!(ready.to_string(), "POLL_IN|POLL_OUT");
//! ```

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// A set of readiness (or interest) flags.
///
/// Always a combination of the defined bits; constructors mask anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Readiness(u8);

/// Interest flags use the same vocabulary as readiness flags.
pub type Interest = Readiness;

impl Readiness {
    /// Empty set.
    pub const NONE: Self = Self(0x00);

    /// Readable without blocking.
    pub const READ: Self = Self(0x01);

    /// Writable without blocking.
    pub const WRITE: Self = Self(0x04);

    /// Error condition pending on the descriptor.
    pub const ERROR: Self = Self(0x08);

    /// Peer hung up.
    pub const HANGUP: Self = Self(0x10);

    /// Descriptor is not open.
    pub const INVALID: Self = Self(0x20);

    const ALL_BITS: u8 = 0x01 | 0x04 | 0x08 | 0x10 | 0x20;

    const NAMED: [(Self, &'static str); 5] = [
        (Self::READ, "POLL_IN"),
        (Self::WRITE, "POLL_OUT"),
        (Self::ERROR, "POLL_ERR"),
        (Self::HANGUP, "POLL_HUP"),
        (Self::INVALID, "POLL_NVAL"),
    ];

    /// Returns the empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self::NONE
    }

    /// Builds a set from raw bits, dropping undefined bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True if every flag in `other` is set.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True if any flag in `other` is set.
    #[must_use]
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// True if no flag is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check if the read flag is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.intersects(Self::READ)
    }

    /// Check if the write flag is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// Check if the error flag is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.intersects(Self::ERROR)
    }

    /// Check if the hangup flag is set.
    #[must_use]
    pub const fn is_hangup(&self) -> bool {
        self.intersects(Self::HANGUP)
    }

    /// Check if the invalid-descriptor flag is set.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.intersects(Self::INVALID)
    }

    /// Combines flags.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes flags.
    #[must_use]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Canonical name of a single flag, or `None` for a multi-flag set.
    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        if self.is_empty() {
            return Some("POLL_NULL");
        }
        Self::NAMED
            .iter()
            .find(|(flag, _)| flag.0 == self.0)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("POLL_NULL");
        }
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl BitOr for Readiness {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Self;

    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Readiness {
    #[inline]
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for Readiness {
    type Output = Self;

    #[inline]
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flag_values_match_poll_layout() {
        assert_eq!(Readiness::NONE.bits(), 0x00);
        assert_eq!(Readiness::READ.bits(), 0x01);
        assert_eq!(Readiness::WRITE.bits(), 0x04);
        assert_eq!(Readiness::ERROR.bits(), 0x08);
        assert_eq!(Readiness::HANGUP.bits(), 0x10);
        assert_eq!(Readiness::INVALID.bits(), 0x20);
    }

    #[test]
    fn from_bits_masks_undefined_bits() {
        let r = Readiness::from_bits(0xff);
        assert_eq!(r.bits(), 0x3d);
        assert!(!Readiness::from_bits(0x02).is_readable());
        assert!(Readiness::from_bits(0x02).is_empty());
    }

    #[test]
    fn predicates() {
        let r = Readiness::READ | Readiness::HANGUP;
        assert!(r.is_readable());
        assert!(r.is_hangup());
        assert!(!r.is_writable());
        assert!(!r.is_error());
        assert!(!r.is_invalid());
        assert!(r.contains(Readiness::READ));
        assert!(!r.contains(Readiness::READ | Readiness::WRITE));
        assert!(r.intersects(Readiness::READ | Readiness::WRITE));
    }

    #[test]
    fn add_remove() {
        let r = Readiness::empty().add(Readiness::WRITE).add(Readiness::ERROR);
        assert_eq!(r.remove(Readiness::WRITE), Readiness::ERROR);
        assert_eq!(Readiness::READ.remove(Readiness::READ), Readiness::NONE);
    }

    #[test]
    fn display_names() {
        assert_eq!(Readiness::NONE.to_string(), "POLL_NULL");
        assert_eq!(Readiness::INVALID.to_string(), "POLL_NVAL");
        assert_eq!(
            (Readiness::ERROR | Readiness::READ).to_string(),
            "POLL_IN|POLL_ERR"
        );
        assert_eq!(Readiness::HANGUP.name(), Some("POLL_HUP"));
        assert_eq!(Readiness::NONE.name(), Some("POLL_NULL"));
        assert_eq!((Readiness::READ | Readiness::WRITE).name(), None);
    }

    #[test]
    fn not_stays_within_defined_bits() {
        let inverted = !Readiness::READ;
        assert!(!inverted.is_readable());
        assert!(inverted.contains(Readiness::WRITE | Readiness::INVALID));
        assert_eq!(inverted.bits() & !0x3d, 0);
    }

    proptest! {
        #[test]
        fn prop_bits_always_defined(a in any::<u8>(), b in any::<u8>()) {
            let x = Readiness::from_bits(a);
            let y = Readiness::from_bits(b);
            for r in [x | y, x & y, !x, x.add(y), x.remove(y)] {
                prop_assert_eq!(r.bits() & !0x3d, 0);
            }
        }

        #[test]
        fn prop_or_contains_both(a in any::<u8>(), b in any::<u8>()) {
            let x = Readiness::from_bits(a);
            let y = Readiness::from_bits(b);
            let both = x | y;
            prop_assert!(both.contains(x));
            prop_assert!(both.contains(y));
            prop_assert_eq!(both.remove(y) | y, both);
        }
    }
}
