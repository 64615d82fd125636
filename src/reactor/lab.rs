//! Deterministic lab backend for testing.
//!
//! [`LabBackend`] implements the polling contract without touching the OS.
//! Readiness is injected by test code through a [`LabHandle`], and time is
//! virtual: a poll that finds nothing ready advances the clock by its timeout
//! and returns immediately.
//!
//! # Example
//!
//! ```
//! use muxloop::reactor::{Backend, Events, LabBackend};
//! use muxloop::Readiness;
//! use std::time::Duration;
//!
//! let mut backend = LabBackend::new();
//! let handle = backend.handle();
//! backend.add(5, Readiness::READ).unwrap();
//!
//! handle.inject(5, Readiness::READ);
//!
//! let mut events = Events::with_capacity(8);
//! assert_eq!(backend.poll(&mut events, Some(Duration::from_millis(10))).unwrap(), 1);
//! assert_eq!(events.get(5), Some(Readiness::READ));
//! ```

use super::{Backend, BackendKind, Events, Interest, Readiness};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
struct LabInner {
    interests: HashMap<RawFd, Interest>,
    pending: VecDeque<(RawFd, Readiness)>,
    failures: VecDeque<io::Error>,
    now: Duration,
    polls: u64,
}

/// A deterministic backend driven by injected readiness.
#[derive(Debug, Default)]
pub struct LabBackend {
    inner: Rc<RefCell<LabInner>>,
}

/// Test-side handle sharing state with a [`LabBackend`].
///
/// Stays usable after the backend has been moved into an event loop.
#[derive(Debug, Clone)]
pub struct LabHandle {
    inner: Rc<RefCell<LabInner>>,
}

impl LabBackend {
    /// Creates a new lab backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle for injecting readiness and scripting failures.
    #[must_use]
    pub fn handle(&self) -> LabHandle {
        LabHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl LabHandle {
    /// Queues readiness for `fd`, delivered by the next poll.
    ///
    /// Flags outside the registered interest are dropped at delivery, except
    /// `ERROR` and `HANGUP`, which are always reported.
    pub fn inject(&self, fd: RawFd, readiness: Readiness) {
        self.inner.borrow_mut().pending.push_back((fd, readiness));
    }

    /// Makes the next poll fail with `err`.
    pub fn fail_next_poll(&self, err: io::Error) {
        self.inner.borrow_mut().failures.push_back(err);
    }

    /// Current interest for `fd`, if registered.
    #[must_use]
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.inner.borrow().interests.get(&fd).copied()
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.borrow().interests.len()
    }

    /// Number of poll calls made so far, failed ones included.
    #[must_use]
    pub fn poll_count(&self) -> u64 {
        self.inner.borrow().polls
    }

    /// Virtual time accumulated by timed-out polls.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }
}

impl Backend for LabBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lab
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        inner.interests.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.interests.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            ));
        }
        inner.pending.retain(|(pending_fd, _)| *pending_fd != fd);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.interests.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            )),
        }
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let mut inner = self.inner.borrow_mut();
        inner.polls += 1;

        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }

        let always = Readiness::ERROR | Readiness::HANGUP;
        while let Some((fd, readiness)) = inner.pending.pop_front() {
            if let Some(&interest) = inner.interests.get(&fd) {
                let delivered = readiness & (interest | always);
                if !delivered.is_empty() {
                    events.merge(fd, delivered);
                }
            }
        }

        if events.is_empty() {
            if let Some(timeout) = timeout {
                inner.now = inner.now.saturating_add(timeout);
            }
        }
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_injected_readiness() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        backend.add(3, Readiness::READ).unwrap();

        handle.inject(3, Readiness::READ);

        let mut events = Events::with_capacity(4);
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(5)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.get(3), Some(Readiness::READ));

        // Delivered once only.
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(5)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn merges_multiple_injections_for_one_fd() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        backend.add(3, Readiness::READ | Readiness::WRITE).unwrap();

        handle.inject(3, Readiness::READ);
        handle.inject(3, Readiness::WRITE);

        let mut events = Events::with_capacity(4);
        backend.poll(&mut events, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events.get(3), Some(Readiness::READ | Readiness::WRITE));
    }

    #[test]
    fn masks_by_interest_but_keeps_error_and_hangup() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        backend.add(4, Readiness::READ).unwrap();

        handle.inject(4, Readiness::WRITE | Readiness::HANGUP | Readiness::ERROR);
        handle.inject(9, Readiness::READ);

        let mut events = Events::with_capacity(4);
        backend.poll(&mut events, None).unwrap();
        assert_eq!(events.get(4), Some(Readiness::HANGUP | Readiness::ERROR));
        assert_eq!(events.get(9), None);
    }

    #[test]
    fn timeout_advances_virtual_time() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        let mut events = Events::with_capacity(4);

        assert_eq!(handle.now(), Duration::ZERO);
        backend
            .poll(&mut events, Some(Duration::from_millis(500)))
            .unwrap();
        backend
            .poll(&mut events, Some(Duration::from_millis(250)))
            .unwrap();
        assert_eq!(handle.now(), Duration::from_millis(750));
        assert_eq!(handle.poll_count(), 2);
    }

    #[test]
    fn scripted_failure_is_returned_once() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        handle.fail_next_poll(io::Error::from_raw_os_error(libc::EINTR));

        let mut events = Events::with_capacity(4);
        let err = backend.poll(&mut events, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINTR));
        assert!(backend.poll(&mut events, None).is_ok());
    }

    #[test]
    fn registration_contract() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();

        backend.add(1, Readiness::READ).unwrap();
        let dup = backend.add(1, Readiness::WRITE).unwrap_err();
        assert_eq!(dup.kind(), io::ErrorKind::AlreadyExists);

        backend.modify(1, Readiness::WRITE).unwrap();
        assert_eq!(handle.interest(1), Some(Readiness::WRITE));

        let missing = backend.modify(2, Readiness::READ).unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        backend.remove(1).unwrap();
        assert_eq!(handle.registration_count(), 0);
        let again = backend.remove(1).unwrap_err();
        assert_eq!(again.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn remove_discards_queued_readiness() {
        let mut backend = LabBackend::new();
        let handle = backend.handle();
        backend.add(6, Readiness::READ).unwrap();
        handle.inject(6, Readiness::READ);
        backend.remove(6).unwrap();
        backend.add(6, Readiness::READ).unwrap();

        let mut events = Events::with_capacity(4);
        assert_eq!(backend.poll(&mut events, None).unwrap(), 0);
    }
}
