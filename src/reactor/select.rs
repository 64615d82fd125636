//! Portable `select(2)` backend.
//!
//! Interest is three independent membership sets (read, write, except). Each
//! poll rebuilds the native `fd_set`s from them, so the cost is O(number of
//! registered descriptors) per poll.
//!
//! # Limits
//!
//! `select` cannot watch descriptors at or above `FD_SETSIZE` (1024 on most
//! systems); `add` rejects them with `InvalidInput`. This is a known
//! scalability ceiling of the facility, which is why this variant is probed
//! last.

// select is reached through raw libc calls; each unsafe block states its contract.
#![allow(unsafe_code)]

use super::{Backend, BackendKind, Events, Interest, Readiness};
use std::collections::BTreeSet;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

/// Largest descriptor value plus one that `select` accepts.
pub const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

/// Portable select backend.
#[derive(Debug, Default)]
pub struct SelectBackend {
    read: BTreeSet<RawFd>,
    write: BTreeSet<RawFd>,
    except: BTreeSet<RawFd>,
}

impl SelectBackend {
    /// Creates an empty select backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fd_set(members: &BTreeSet<RawFd>) -> libc::fd_set {
        let mut set = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO initializes the whole set; every member was
        // range-checked against FD_SETSIZE on add.
        unsafe {
            libc::FD_ZERO(set.as_mut_ptr());
            let mut set = set.assume_init();
            for &fd in members {
                libc::FD_SET(fd, &mut set);
            }
            set
        }
    }

    fn timeval(timeout: Option<Duration>) -> Option<libc::timeval> {
        timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        })
    }

    fn collect(
        events: &mut Events,
        members: &BTreeSet<RawFd>,
        ready: &libc::fd_set,
        flag: Readiness,
    ) {
        for &fd in members {
            // SAFETY: fd is within FD_SETSIZE and `ready` was filled by select.
            if unsafe { libc::FD_ISSET(fd, ready) } {
                events.merge(fd, flag);
            }
        }
    }

    fn max_fd(&self) -> Option<RawFd> {
        [&self.read, &self.write, &self.except]
            .into_iter()
            .filter_map(|set| set.last().copied())
            .max()
    }
}

impl Backend for SelectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} outside select range 0..{FD_SETSIZE}"),
            ));
        }
        if interest.is_readable() {
            self.read.insert(fd);
        }
        if interest.is_writable() {
            self.write.insert(fd);
        }
        if interest.is_error() {
            self.except.insert(fd);
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.read.remove(&fd);
        self.write.remove(&fd);
        self.except.remove(&fd);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.remove(fd)?;
        self.add(fd, interest)
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();

        let nfds = self.max_fd().map_or(0, |fd| fd + 1);
        let mut read = Self::fd_set(&self.read);
        let mut write = Self::fd_set(&self.write);
        let mut except = Self::fd_set(&self.except);
        let mut tv = Self::timeval(timeout);
        let tv_ptr = tv
            .as_mut()
            .map_or(ptr::null_mut(), |t| t as *mut libc::timeval);

        // SAFETY: all sets are initialized, nfds bounds every member, and tv
        // outlives the call.
        let n = unsafe { libc::select(nfds, &mut read, &mut write, &mut except, tv_ptr) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(0);
        }

        Self::collect(events, &self.read, &read, Readiness::READ);
        Self::collect(events, &self.write, &write, Readiness::WRITE);
        Self::collect(events, &self.except, &except, Readiness::ERROR);
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn add_tracks_three_sets() {
        init_test("select_add_tracks_three_sets");
        let mut backend = SelectBackend::new();
        backend
            .add(5, Readiness::READ | Readiness::ERROR)
            .expect("add");
        backend.add(9, Readiness::WRITE).expect("add");

        crate::assert_with_log!(
            backend.read.contains(&5),
            "read member",
            true,
            backend.read.contains(&5)
        );
        assert!(backend.except.contains(&5));
        assert!(!backend.write.contains(&5));
        assert!(backend.write.contains(&9));
        assert_eq!(backend.max_fd(), Some(9));

        backend.modify(9, Readiness::READ).expect("modify");
        assert!(backend.read.contains(&9));
        assert!(!backend.write.contains(&9));

        backend.remove(5).expect("remove");
        backend.remove(9).expect("remove");
        assert_eq!(backend.max_fd(), None);
        crate::test_complete!("select_add_tracks_three_sets");
    }

    #[test]
    fn rejects_descriptors_outside_fd_setsize() {
        let mut backend = SelectBackend::new();
        let err = backend
            .add(FD_SETSIZE as RawFd, Readiness::READ)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = backend.add(-1, Readiness::READ).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(backend.max_fd(), None);
    }

    #[test]
    fn timeval_normalization() {
        assert!(SelectBackend::timeval(None).is_none());
        let tv = SelectBackend::timeval(Some(Duration::from_millis(2250))).unwrap();
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec as i64, 250_000);
    }

    #[test]
    fn poll_merges_read_and_write_sets() {
        init_test("select_poll_merges_read_and_write_sets");
        let mut backend = SelectBackend::new();
        let (a, mut b) = UnixStream::pair().expect("pair");
        b.write_all(b"x").expect("write");
        let fd = a.as_raw_fd();

        backend
            .add(fd, Readiness::READ | Readiness::WRITE)
            .expect("add");

        let mut events = Events::with_capacity(4);
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(100)))
            .expect("poll");
        crate::assert_with_log!(n == 1, "one descriptor", 1usize, n);
        let ready = events.get(fd).expect("fd reported");
        crate::assert_with_log!(
            ready == Readiness::READ | Readiness::WRITE,
            "both bits",
            Readiness::READ | Readiness::WRITE,
            ready
        );
        crate::test_complete!("select_poll_merges_read_and_write_sets");
    }

    #[test]
    fn poll_timeout_with_no_descriptors() {
        let mut backend = SelectBackend::new();
        let mut events = Events::with_capacity(4);
        let start = Instant::now();
        let n = backend
            .poll(&mut events, Some(Duration::from_millis(50)))
            .expect("poll");
        let elapsed = start.elapsed();
        assert_eq!(n, 0);
        assert!(events.is_empty());
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn idle_socket_is_not_readable() {
        let mut backend = SelectBackend::new();
        let (a, _b) = UnixStream::pair().expect("pair");
        backend.add(a.as_raw_fd(), Readiness::READ).expect("add");

        let mut events = Events::with_capacity(4);
        let n = backend.poll(&mut events, Some(Duration::ZERO)).unwrap();
        assert_eq!(n, 0);
    }
}
