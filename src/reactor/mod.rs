//! Backend abstraction for I/O readiness multiplexing.
//!
//! Every native facility is wrapped in a variant implementing [`Backend`], the
//! single polling contract the dispatch loop depends on. Callers above this
//! module never learn which variant is active.
//!
//! # Variants
//!
//! | Variant | Facility | Hosts | Notes |
//! |---------|----------|-------|-------|
//! | [`BackendKind::Epoll`] | `epoll(7)` | Linux, Android | native modify |
//! | [`BackendKind::Kqueue`] | `kqueue(2)` | macOS, iOS, BSDs | two filters per descriptor |
//! | [`BackendKind::Select`] | `select(2)` | any Unix | O(n), capped at `FD_SETSIZE` |
//! | [`BackendKind::Lab`] | in-memory | everywhere | deterministic, test only |
//!
//! [`open_backend`] resolves the probe order once, at construction time.

pub mod lab;
pub mod readiness;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
))]
pub mod kqueue;

#[cfg(unix)]
pub mod select;

pub use lab::{LabBackend, LabHandle};
pub use readiness::{Interest, Readiness};

use crate::error::{Error, Result};
use crate::tracing_compat::debug;
use hashbrown::HashMap;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// The polling contract implemented by every backend variant.
///
/// Backends are driven from a single thread; `&mut self` receivers reflect
/// that. Registering a descriptor twice is a contract violation: callers use
/// [`modify`](Backend::modify) to change interest.
pub trait Backend: fmt::Debug {
    /// Which native facility this backend wraps.
    fn kind(&self) -> BackendKind;

    /// Begins monitoring `fd` for `interest`.
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stops monitoring `fd`.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Replaces the interest set of an already monitored `fd`.
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks up to `timeout` (forever when `None`) for readiness.
    ///
    /// Clears `events`, then fills it with one entry per ready descriptor.
    /// A pure timeout yields `Ok(0)`.
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Identifies a backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linux scalable kernel queue.
    Epoll,
    /// BSD kernel event queue.
    Kqueue,
    /// Portable `select(2)` sets.
    Select,
    /// Deterministic in-memory backend.
    Lab,
}

impl BackendKind {
    /// Native variants in the order they are probed.
    pub const PROBE_ORDER: [Self; 3] = [Self::Epoll, Self::Kqueue, Self::Select];

    /// Lowercase name used in logs, env vars and config files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Epoll => "epoll",
            Self::Kqueue => "kqueue",
            Self::Select => "select",
            Self::Lab => "lab",
        }
    }

    /// True if this variant is compiled for the current target.
    #[must_use]
    pub const fn is_compiled(&self) -> bool {
        match self {
            Self::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            Self::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly",
            )),
            Self::Select => cfg!(unix),
            Self::Lab => true,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" => Ok(Self::Epoll),
            "kqueue" => Ok(Self::Kqueue),
            "select" => Ok(Self::Select),
            "lab" => Ok(Self::Lab),
            other => Err(Error::InvalidConfig(format!("unknown backend `{other}`"))),
        }
    }
}

/// A raw readiness event: descriptor plus merged flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// The ready descriptor.
    pub fd: RawFd,
    /// All flags reported for `fd` in one poll.
    pub readiness: Readiness,
}

/// Reusable buffer of raw events, at most one entry per descriptor.
#[derive(Debug, Default)]
pub struct Events {
    inner: Vec<Event>,
    index: HashMap<RawFd, usize>,
}

impl Events {
    /// Creates a new events buffer with capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Clears the buffer.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.index.clear();
    }

    /// OR-combines `readiness` into the entry for `fd`.
    ///
    /// Unseen descriptors start from [`Readiness::NONE`], so several filters
    /// reporting on one descriptor collapse into a single entry.
    pub fn merge(&mut self, fd: RawFd, readiness: Readiness) {
        let len = self.inner.len();
        let slot = *self.index.entry(fd).or_insert(len);
        if slot == len {
            self.inner.push(Event {
                fd,
                readiness: Readiness::NONE,
            });
        }
        self.inner[slot].readiness |= readiness;
    }

    /// Flags recorded for `fd`, if any.
    #[must_use]
    pub fn get(&self, fd: RawFd) -> Option<Readiness> {
        self.index.get(&fd).map(|&slot| self.inner[slot].readiness)
    }

    /// Number of distinct descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over events in first-seen order.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Opens the first backend in `candidates` that the host supports.
///
/// Variants not compiled for this target are skipped, as are variants whose
/// native handle cannot be created. Fails with [`Error::NoBackend`] when
/// nothing opens.
pub fn open_backend(candidates: &[BackendKind], max_events: usize) -> Result<Box<dyn Backend>> {
    let mut tried = Vec::with_capacity(candidates.len());
    for &kind in candidates {
        tried.push(kind);
        match open_one(kind, max_events) {
            Ok(backend) => {
                debug!(backend = %kind, "using event model: {}", kind);
                return Ok(backend);
            }
            Err(err) => {
                debug!(backend = %kind, error = %err, "backend unavailable");
            }
        }
    }
    Err(Error::NoBackend { tried })
}

fn open_one(kind: BackendKind, max_events: usize) -> io::Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Epoll => open_epoll(max_events),
        BackendKind::Kqueue => open_kqueue(max_events),
        BackendKind::Select => open_select(),
        BackendKind::Lab => Ok(Box::new(LabBackend::new())),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_epoll(max_events: usize) -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(epoll::EpollBackend::new(max_events)?))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_epoll(_max_events: usize) -> io::Result<Box<dyn Backend>> {
    Err(unsupported(BackendKind::Epoll))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
))]
fn open_kqueue(max_events: usize) -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(kqueue::KqueueBackend::new(max_events)?))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
)))]
fn open_kqueue(_max_events: usize) -> io::Result<Box<dyn Backend>> {
    Err(unsupported(BackendKind::Kqueue))
}

#[cfg(unix)]
fn open_select() -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(select::SelectBackend::new()))
}

#[cfg(not(unix))]
fn open_select() -> io::Result<Box<dyn Backend>> {
    Err(unsupported(BackendKind::Select))
}

#[allow(dead_code)]
fn unsupported(kind: BackendKind) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{kind} is not available on this target"),
    )
}
