//! Optional tracing integration.
//!
//! With the `tracing-integration` feature (on by default) these macros forward
//! to [`tracing`]. Without it they expand to nothing, so call sites never need
//! their own `cfg` attributes.
//!
//! ```ignore
//! use crate::tracing_compat::{debug, error};
//!
//! debug!(backend = %kind, "using event model");
//! error!(error = %err, "poll failed");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op `trace!`.
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __muxloop_noop_trace {
        ($($arg:tt)*) => {};
    }

    /// No-op `debug!`.
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __muxloop_noop_debug {
        ($($arg:tt)*) => {};
    }

    /// No-op `info!`.
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __muxloop_noop_info {
        ($($arg:tt)*) => {};
    }

    /// No-op `warn!`.
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __muxloop_noop_warn {
        ($($arg:tt)*) => {};
    }

    /// No-op `error!`.
    #[macro_export]
    #[doc(hidden)]
    macro_rules! __muxloop_noop_error {
        ($($arg:tt)*) => {};
    }
}

#[cfg(not(feature = "tracing-integration"))]
pub use crate::{
    __muxloop_noop_debug as debug, __muxloop_noop_error as error, __muxloop_noop_info as info,
    __muxloop_noop_trace as trace, __muxloop_noop_warn as warn,
};
