//! BSD `kqueue` backend.
//!
//! kqueue has no combined per-descriptor registration: readability and
//! writability are two independent filters (`EVFILT_READ`, `EVFILT_WRITE`).
//! This backend therefore:
//!
//! - submits one change request per filter on add and remove,
//! - remembers each descriptor's last interest, because deleting requires
//!   naming the filters that were added,
//! - implements `modify` as remove followed by add (not atomic in the kernel,
//!   atomic for this single-threaded caller),
//! - merges the per-filter events of one poll into one flag set per
//!   descriptor.
//!
//! Filters are level-triggered (no `EV_CLEAR`), matching the epoll backend.

// kqueue is reached through raw libc calls; each unsafe block states its contract.
#![allow(unsafe_code)]

use super::{Backend, BackendKind, Events, Interest, Readiness};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

/// BSD kernel queue backend.
pub struct KqueueBackend {
    kq: OwnedFd,
    /// Last interest per descriptor, needed to delete the right filters.
    interests: HashMap<RawFd, Interest>,
    buffer: Vec<libc::kevent>,
}

impl KqueueBackend {
    /// Creates a new kqueue able to report `max_events` filter events per poll.
    pub fn new(max_events: usize) -> io::Result<Self> {
        // SAFETY: kqueue has no arguments.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by kqueue and is owned by nobody else.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: CLOEXEC on a descriptor we own.
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };

        Ok(Self {
            kq,
            interests: HashMap::new(),
            buffer: Vec::with_capacity(max_events.max(1)),
        })
    }

    fn change(fd: RawFd, filter: FilterKind, flags: ChangeFlags) -> libc::kevent {
        // SAFETY: kevent is a plain C struct; all-zero is a valid value.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as _;
        ev.filter = match filter {
            FilterKind::Read => libc::EVFILT_READ,
            FilterKind::Write => libc::EVFILT_WRITE,
        };
        ev.flags = match flags {
            ChangeFlags::Add => libc::EV_ADD,
            ChangeFlags::Delete => libc::EV_DELETE,
        };
        ev
    }

    /// One change per filter the interest asks for.
    fn changes(fd: RawFd, interest: Interest, flags: ChangeFlags) -> SmallVec<[libc::kevent; 2]> {
        let mut changes = SmallVec::new();
        if interest.is_readable() {
            changes.push(Self::change(fd, FilterKind::Read, flags));
        }
        if interest.is_writable() {
            changes.push(Self::change(fd, FilterKind::Write, flags));
        }
        changes
    }

    fn submit(&self, change: &libc::kevent) -> io::Result<()> {
        // SAFETY: one valid change, no event list, no timeout.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn timespec(timeout: Option<Duration>) -> Option<libc::timespec> {
        timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        })
    }

    fn event_to_readiness(ev: &libc::kevent) -> Readiness {
        let mut readiness = Readiness::NONE;
        if ev.filter == libc::EVFILT_READ {
            readiness |= Readiness::READ;
        } else if ev.filter == libc::EVFILT_WRITE {
            readiness |= Readiness::WRITE;
        }
        if ev.flags & libc::EV_EOF != 0 {
            readiness |= Readiness::HANGUP;
        }
        if ev.flags & libc::EV_ERROR != 0 {
            readiness |= Readiness::ERROR;
        }
        readiness
    }
}

#[derive(Debug, Clone, Copy)]
enum FilterKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
enum ChangeFlags {
    Add,
    Delete,
}

impl Backend for KqueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        let changes = Self::changes(fd, interest, ChangeFlags::Add);
        for (i, change) in changes.iter().enumerate() {
            if let Err(err) = self.submit(change) {
                // Undo filters already added so the descriptor is left unregistered.
                for added in &changes[..i] {
                    let mut undo = *added;
                    undo.flags = libc::EV_DELETE;
                    let _ = self.submit(&undo);
                }
                return Err(err);
            }
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let interest = self.interests.remove(&fd).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "descriptor not registered")
        })?;
        let mut result = Ok(());
        for change in Self::changes(fd, interest, ChangeFlags::Delete) {
            if let Err(err) = self.submit(&change) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.remove(fd)?;
        self.add(fd, interest)
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        self.buffer.clear();

        let ts = Self::timespec(timeout);
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);
        let capacity = self.buffer.capacity().min(libc::c_int::MAX as usize);

        // SAFETY: no change list; the event list has room for `capacity`
        // entries; ts outlives the call.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buffer.as_mut_ptr(),
                capacity as _,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kevent initialized the first n entries.
        unsafe { self.buffer.set_len(n as usize) };

        for ev in &self.buffer {
            events.merge(ev.ident as RawFd, Self::event_to_readiness(ev));
        }
        Ok(events.len())
    }
}

impl std::fmt::Debug for KqueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueBackend")
            .field("kq", &self.kq.as_raw_fd())
            .field("registration_count", &self.interests.len())
            .finish_non_exhaustive()
    }
}
