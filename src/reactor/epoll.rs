//! Linux `epoll` backend.
//!
//! Level-triggered: a descriptor keeps being reported while the condition
//! holds. Interest maps almost one-to-one onto native bits and `modify` uses
//! `EPOLL_CTL_MOD` directly.
//!
//! | Readiness | Interest bit | Reported from |
//! |-----------|--------------|---------------|
//! | `READ` | `EPOLLIN` | `EPOLLIN`, `EPOLLPRI` |
//! | `WRITE` | `EPOLLOUT` | `EPOLLOUT` |
//! | `ERROR` | `EPOLLERR` | `EPOLLERR` |
//! | `HANGUP` | `EPOLLRDHUP` | `EPOLLHUP`, `EPOLLRDHUP` |
//!
//! The kernel always reports `EPOLLERR` and `EPOLLHUP`, whatever the interest.

// epoll is reached through raw libc calls; each unsafe block states its contract.
#![allow(unsafe_code)]

use super::{Backend, BackendKind, Events, Interest, Readiness};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Scalable kernel queue backend.
pub struct EpollBackend {
    epfd: OwnedFd,
    buffer: Vec<libc::epoll_event>,
}

impl EpollBackend {
    /// Creates a new epoll instance able to report `max_events` per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by epoll_create1 and is owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            epfd,
            buffer: Vec::with_capacity(max_events.max(1)),
        })
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut bits = 0;
        if interest.is_readable() {
            bits |= libc::EPOLLIN;
        }
        if interest.is_writable() {
            bits |= libc::EPOLLOUT;
        }
        if interest.is_error() {
            bits |= libc::EPOLLERR;
        }
        if interest.is_hangup() {
            bits |= libc::EPOLLRDHUP;
        }
        bits as u32
    }

    fn epoll_to_readiness(bits: u32) -> Readiness {
        let mut readiness = Readiness::NONE;
        if bits & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            readiness |= Readiness::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            readiness |= Readiness::WRITE;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            readiness |= Readiness::ERROR;
        }
        if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            readiness |= Readiness::HANGUP;
        }
        readiness
    }

    /// Milliseconds for `epoll_wait`: `-1` blocks forever, partial
    /// milliseconds round up so a short timeout never becomes a busy poll.
    fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(d) => {
                let mut ms = d.as_millis();
                if d.subsec_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interest_to_epoll(interest),
            u64: fd as u64,
        };
        // SAFETY: event lives across the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        // Kernels before 2.6.9 require a non-null event even for DEL.
        self.ctl(libc::EPOLL_CTL_DEL, fd, Readiness::NONE)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        self.buffer.clear();

        let capacity = self.buffer.capacity().min(libc::c_int::MAX as usize);
        // SAFETY: the buffer has room for `capacity` entries and the kernel
        // writes at most that many.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                capacity as libc::c_int,
                Self::timeout_ms(timeout),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_wait initialized the first n entries.
        unsafe { self.buffer.set_len(n as usize) };

        for raw in &self.buffer {
            let bits = raw.events;
            let fd = raw.u64 as RawFd;
            events.merge(fd, Self::epoll_to_readiness(bits));
        }
        Ok(events.len())
    }
}

impl std::fmt::Debug for EpollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollBackend")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("max_events", &self.buffer.capacity())
            .finish()
    }
}
