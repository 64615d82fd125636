//! Muxloop: a single-threaded I/O readiness multiplexer.
//!
//! # Overview
//!
//! Muxloop lets a process register interest in readiness (readable, writable,
//! error, hangup) on many descriptors and learn, in one blocking call, which
//! of them can make progress. Code above it is written against one
//! event-driven interface whatever notification facility the host offers.
//!
//! - **One polling contract**: `epoll`, `kqueue` and `select` all sit behind
//!   [`reactor::Backend`]; the best one available is chosen once, at
//!   construction.
//! - **Broadcast dispatch**: every handler sees every event of a cycle and
//!   picks out what concerns it.
//! - **Safe mutation during dispatch**: handlers may remove themselves or
//!   each other; removals land between cycles.
//! - **Natural shutdown**: [`EventLoop::run`] returns once no reference
//!   handler is left.
//! - **Deterministic testing**: the lab backend injects readiness and
//!   failures without touching the OS.
//!
//! # Module Structure
//!
//! - [`reactor`]: polling contract, readiness flags, backend variants
//! - [`event_loop`]: dispatch loop, handlers, descriptor registry
//! - [`config`]: loop configuration (defaults, environment, TOML file)
//! - [`error`](mod@error): error types and errno helpers
//! - [`tracing_compat`]: logging macros (requires `tracing-integration` for output)
//!
//! # Example
//!
//! ```no_run
//! use muxloop::{handler_fn, EventLoop, Readiness};
//! use std::os::unix::net::UnixListener;
//! use std::rc::Rc;
//!
//! let lp = EventLoop::new()?;
//! let listener = Rc::new(UnixListener::bind("/tmp/muxloop.sock")?);
//! lp.register(listener.clone(), Readiness::READ)?;
//!
//! lp.add_handler(
//!     handler_fn(|_lp, events| {
//!         for event in events {
//!             if let Some(listener) = event.downcast_ref::<UnixListener>() {
//!                 let (_conn, _addr) = listener.accept()?;
//!             }
//!         }
//!         Ok(())
//!     }),
//!     true,
//! );
//! lp.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

#[cfg(not(unix))]
compile_error!("muxloop requires a Unix target: every backend is built on POSIX descriptors.");

pub mod config;
pub mod error;
pub mod event_loop;
pub mod reactor;
pub mod tracing_compat;

#[cfg(test)]
pub mod test_utils;

pub use config::LoopConfig;
pub use error::{errno_from_io, is_transient, socket_error, Error, Result};
pub use event_loop::{
    handler_fn, Endpoint, EventLoop, FnHandler, Handler, HandlerId, HandlerResult, LoopState,
    ReadyEvent,
};
pub use reactor::{BackendKind, Interest, Readiness};
