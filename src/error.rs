//! Error types and errno helpers.
//!
//! Errors fall into four groups:
//!
//! - **Fatal**: no readiness facility could be opened ([`Error::NoBackend`]).
//! - **Contract**: double registration, removal of an unknown descriptor or
//!   handler, re-entrant `run`. Reported synchronously at the call site.
//! - **Configuration**: rejected [`LoopConfig`](crate::LoopConfig) values.
//! - **I/O**: failures from the native calls themselves.
//!
//! Poll and handler failures that happen once the loop is running never
//! surface as `Error`; the loop logs them and keeps going. [`is_transient`]
//! is the classification it uses.

use crate::event_loop::HandlerId;
use crate::reactor::BackendKind;
use nix::errno::Errno;
use std::io;
use std::os::fd::{AsFd, RawFd};

/// Errors returned by the event loop and its backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// None of the candidate facilities could be opened on this host.
    #[error("no readiness facility available (tried {tried:?})")]
    NoBackend {
        /// Candidates attempted, in probe order.
        tried: Vec<BackendKind>,
    },

    /// The descriptor already has a registration.
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    /// The descriptor has no registration.
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    /// The handler is not in the live list, or its removal is already pending.
    #[error("handler {0} is not registered")]
    HandlerNotFound(HandlerId),

    /// `run` or `run_once` was entered while a cycle was in progress.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A native call failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors the process cannot recover from.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NoBackend { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Extracts the platform errno carried by an I/O error.
///
/// Returns `None` for synthetic errors that were not built from an OS code.
#[must_use]
pub fn errno_from_io(err: &io::Error) -> Option<Errno> {
    err.raw_os_error().map(Errno::from_raw)
}

/// True for poll failures the loop treats as routine.
///
/// An interrupted wait (`EINTR`) happens whenever a signal lands during the
/// poll; `EPIPE` shows up when a peer closed the local end of a pipe.
#[must_use]
pub fn is_transient(err: &io::Error) -> bool {
    match errno_from_io(err) {
        Some(errno) => matches!(errno, Errno::EINTR | Errno::EPIPE),
        None => matches!(
            err.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::BrokenPipe
        ),
    }
}

/// Reads and clears the pending error on a socket (`SO_ERROR`).
///
/// Collaborators call this after observing [`Readiness::ERROR`](crate::Readiness::ERROR).
/// Returns `Ok(None)` when nothing is pending.
pub fn socket_error<S: AsFd + ?Sized>(sock: &S) -> io::Result<Option<io::Error>> {
    use nix::sys::socket::{getsockopt, sockopt};

    let code = getsockopt(&sock.as_fd(), sockopt::SocketError)?;
    if code == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(code)))
    }
}
