//! Descriptor registry.
//!
//! Maps each registered descriptor back to the endpoint that owns it so raw
//! `(fd, flags)` events can be handed to handlers as application objects.
//! Entries are weak: the registry never keeps an endpoint alive.

use crate::error::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

/// Anything exposing a stable descriptor for its lifetime.
///
/// Blanket-implemented for every `AsRawFd + 'static` type; [`as_any`]
/// lets handlers recover the concrete type of an endpoint they receive.
/// Call it on the endpoint itself, not on an `Rc` wrapping it (which is an
/// endpoint too); [`ReadyEvent::downcast_ref`](crate::ReadyEvent::downcast_ref)
/// does this for you.
///
/// [`as_any`]: Endpoint::as_any
pub trait Endpoint: AsRawFd + Any {
    /// Upcast for downcasting to the concrete endpoint type.
    fn as_any(&self) -> &dyn Any;
}

impl<T: AsRawFd + Any> Endpoint for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Descriptor to endpoint lookup table.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<RawFd, Weak<dyn Endpoint>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, fd: RawFd, endpoint: &Rc<dyn Endpoint>) -> Result<()> {
        if self.entries.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        self.entries.insert(fd, Rc::downgrade(endpoint));
        Ok(())
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> Result<()> {
        self.entries
            .remove(&fd)
            .map(drop)
            .ok_or(Error::NotRegistered(fd))
    }

    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    /// The live endpoint for `fd`, or `None` if unknown or already dropped.
    pub(crate) fn resolve(&self, fd: RawFd) -> Option<Rc<dyn Endpoint>> {
        self.entries.get(&fd).and_then(Weak::upgrade)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered descriptors in ascending order.
    pub(crate) fn descriptors(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.entries.keys().copied().collect();
        fds.sort_unstable();
        fds
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("descriptors", &self.descriptors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct FakeEndpoint(RawFd);

    impl AsRawFd for FakeEndpoint {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    fn endpoint(fd: RawFd) -> Rc<dyn Endpoint> {
        Rc::new(FakeEndpoint(fd))
    }

    #[test]
    fn insert_resolve_remove() {
        let mut registry = Registry::new();
        let ep = endpoint(4);
        registry.insert(4, &ep).unwrap();

        let resolved = registry.resolve(4).expect("resolved");
        assert!(Rc::ptr_eq(&resolved, &ep));
        assert_eq!(resolved.as_raw_fd(), 4);
        assert!(registry.contains(4));

        registry.remove(4).unwrap();
        assert!(registry.is_empty());
        assert!(registry.resolve(4).is_none());
    }

    #[test]
    fn duplicate_insert_and_missing_remove_are_errors() {
        let mut registry = Registry::new();
        let ep = endpoint(2);
        registry.insert(2, &ep).unwrap();
        assert!(matches!(
            registry.insert(2, &ep),
            Err(Error::AlreadyRegistered(2))
        ));
        assert!(matches!(registry.remove(3), Err(Error::NotRegistered(3))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_does_not_keep_endpoints_alive() {
        let mut registry = Registry::new();
        let ep = endpoint(8);
        registry.insert(8, &ep).unwrap();
        assert_eq!(Rc::strong_count(&ep), 1);

        drop(ep);
        assert!(registry.resolve(8).is_none());
        assert!(registry.contains(8), "entry stays until removed");
    }

    #[test]
    fn downcast_through_as_any() {
        let ep = endpoint(11);
        // Deref first: `Rc<dyn Endpoint>` is itself `AsRawFd + Any`.
        let concrete = (*ep).as_any().downcast_ref::<FakeEndpoint>();
        assert_eq!(concrete.map(|e| e.0), Some(11));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(RawFd),
        Remove(RawFd),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..16i32).prop_map(Op::Add),
            (0..16i32).prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Valid add/remove sequences leave exactly their net effect.
        #[test]
        fn prop_registry_reflects_net_effect(ops in proptest::collection::vec(arb_op(), 0..64)) {
            let mut registry = Registry::new();
            let mut model = BTreeSet::new();
            let mut keep = Vec::new();

            for op in ops {
                match op {
                    Op::Add(fd) if !model.contains(&fd) => {
                        let ep = endpoint(fd);
                        registry.insert(fd, &ep).unwrap();
                        keep.push(ep);
                        model.insert(fd);
                    }
                    Op::Remove(fd) if model.contains(&fd) => {
                        registry.remove(fd).unwrap();
                        model.remove(&fd);
                    }
                    _ => {}
                }
            }

            let expected: Vec<RawFd> = model.into_iter().collect();
            prop_assert_eq!(registry.descriptors(), expected.clone());
            for fd in expected {
                let resolved = registry.resolve(fd);
                prop_assert!(resolved.is_some());
                prop_assert_eq!(resolved.map(|e| e.as_raw_fd()), Some(fd));
            }
        }
    }
}
