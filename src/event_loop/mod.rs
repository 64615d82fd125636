//! The dispatch loop.
//!
//! [`EventLoop`] owns one backend, the descriptor registry and the handler
//! list. Each cycle:
//!
//! 1. polls the backend with a bounded timeout,
//! 2. resolves every `(fd, flags)` pair to its endpoint,
//! 3. hands the whole batch to every live handler, in registration order,
//! 4. applies the handler removals requested during step 3.
//!
//! [`run`](EventLoop::run) repeats cycles until no reference handler is
//! left, checked at the top of each cycle.
//!
//! # Failure boundary
//!
//! Nothing that happens inside a running cycle escapes it. Poll failures are
//! logged (transient ones quietly), handler errors and handler panics are
//! logged and isolated to that handler, which stays registered.
//!
//! # Re-entrancy
//!
//! All methods take `&self`, so handlers receive the loop and may register
//! endpoints or add and remove handlers while being dispatched. Starting a
//! nested cycle from a handler is refused with [`Error::AlreadyRunning`].

mod handlers;
mod registry;

pub use handlers::{handler_fn, FnHandler, Handler, HandlerId, HandlerResult};
pub use registry::Endpoint;

use crate::config::LoopConfig;
use crate::error::{is_transient, Error, Result};
use crate::reactor::{open_backend, Backend, BackendKind, Events, Interest, Readiness};
use crate::tracing_compat::{debug, error, trace, warn};
use handlers::HandlerSet;
use registry::Registry;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

/// A readiness event resolved to its endpoint.
#[derive(Clone)]
pub struct ReadyEvent {
    /// The endpoint registered for `fd`.
    pub endpoint: Rc<dyn Endpoint>,
    /// The ready descriptor.
    pub fd: RawFd,
    /// Flags reported for `fd` this cycle.
    pub readiness: Readiness,
}

impl ReadyEvent {
    /// The endpoint as its concrete type, if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.endpoint).as_any().downcast_ref::<T>()
    }

    /// True if this event belongs to `endpoint`.
    #[must_use]
    pub fn is_for(&self, endpoint: &Rc<dyn Endpoint>) -> bool {
        Rc::ptr_eq(&self.endpoint, endpoint)
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent")
            .field("fd", &self.fd)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

/// Whether a `run` or `run_once` invocation is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Inside `run` or `run_once`.
    Running,
}

/// Single-threaded readiness dispatch loop.
pub struct EventLoop {
    backend: RefCell<Box<dyn Backend>>,
    kind: BackendKind,
    events: RefCell<Events>,
    registry: RefCell<Registry>,
    handlers: RefCell<HandlerSet>,
    config: LoopConfig,
    state: Cell<LoopState>,
    cycles: Cell<u64>,
}

impl EventLoop {
    /// Creates a loop with the default configuration.
    ///
    /// Fails with [`Error::NoBackend`] when the host has no usable facility.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a loop, probing `config.backends` in order.
    pub fn with_config(config: LoopConfig) -> Result<Self> {
        config.validate()?;
        let backend = open_backend(&config.backends, config.max_events)?;
        Ok(Self::assemble(backend, config))
    }

    /// Creates a loop around an already opened backend.
    pub fn with_backend(backend: Box<dyn Backend>, config: LoopConfig) -> Result<Self> {
        config.validate()?;
        debug!(backend = %backend.kind(), "using event model: {}", backend.kind());
        Ok(Self::assemble(backend, config))
    }

    fn assemble(backend: Box<dyn Backend>, config: LoopConfig) -> Self {
        Self {
            kind: backend.kind(),
            backend: RefCell::new(backend),
            events: RefCell::new(Events::with_capacity(config.max_events)),
            registry: RefCell::new(Registry::new()),
            handlers: RefCell::new(HandlerSet::new()),
            config,
            state: Cell::new(LoopState::Idle),
            cycles: Cell::new(0),
        }
    }

    /// Starts monitoring `endpoint` for `interest`.
    ///
    /// The loop keeps only a weak reference; the caller owns the endpoint.
    /// Fails with [`Error::AlreadyRegistered`] if its descriptor is known.
    pub fn register(&self, endpoint: Rc<dyn Endpoint>, interest: Interest) -> Result<()> {
        let fd = endpoint.as_raw_fd();
        self.registry.borrow_mut().insert(fd, &endpoint)?;
        let added = self.backend.borrow_mut().add(fd, interest);
        if let Err(err) = added {
            // Keep registry and backend in agreement.
            let _ = self.registry.borrow_mut().remove(fd);
            return Err(err.into());
        }
        trace!(fd, interest = %interest, "registered endpoint");
        Ok(())
    }

    /// Stops monitoring `endpoint`.
    ///
    /// The registry entry is dropped even if the backend reports an error,
    /// which is then returned.
    pub fn unregister(&self, endpoint: &dyn Endpoint) -> Result<()> {
        let fd = endpoint.as_raw_fd();
        self.registry.borrow_mut().remove(fd)?;
        self.backend.borrow_mut().remove(fd)?;
        trace!(fd, "unregistered endpoint");
        Ok(())
    }

    /// Replaces the interest set of a registered endpoint.
    pub fn modify(&self, endpoint: &dyn Endpoint, interest: Interest) -> Result<()> {
        let fd = endpoint.as_raw_fd();
        if !self.registry.borrow().contains(fd) {
            return Err(Error::NotRegistered(fd));
        }
        self.backend.borrow_mut().modify(fd, interest)?;
        trace!(fd, interest = %interest, "modified endpoint");
        Ok(())
    }

    /// Appends `handler` to the live list.
    ///
    /// A `reference` handler keeps [`run`](Self::run) going. Handlers added
    /// while a cycle is dispatching first run in the next cycle.
    pub fn add_handler<H: Handler + 'static>(&self, handler: H, reference: bool) -> HandlerId {
        let shared: Rc<RefCell<dyn Handler>> = Rc::new(RefCell::new(handler));
        let id = self.handlers.borrow_mut().add(shared, reference);
        trace!(handler = %id, reference, "added handler");
        id
    }

    /// Removes a handler.
    ///
    /// It leaves the reference set at once. During dispatch it is skipped for
    /// the rest of the cycle and leaves the live list when the cycle ends.
    pub fn remove_handler(&self, id: HandlerId) -> Result<()> {
        self.handlers.borrow_mut().remove(id)?;
        trace!(handler = %id, "removed handler");
        Ok(())
    }

    /// Runs cycles until no reference handler remains.
    ///
    /// Returns at a cycle boundary, never mid-cycle. Poll and handler
    /// failures are logged, never returned.
    pub fn run(&self) -> Result<()> {
        let _running = RunGuard::enter(&self.state)?;
        debug!(backend = %self.kind, "event loop running");
        while self.has_references() {
            self.cycle(Some(self.config.poll_interval));
        }
        debug!(cycles = self.cycles.get(), "no reference handlers left, stopping");
        Ok(())
    }

    /// Runs exactly one cycle and returns the number of events dispatched.
    ///
    /// `None` blocks until something is ready.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let _running = RunGuard::enter(&self.state)?;
        Ok(self.cycle(timeout))
    }

    /// Polls once and returns the resolved events without dispatching them.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        Ok(self.poll_events(timeout)?)
    }

    fn cycle(&self, timeout: Option<Duration>) -> usize {
        let batch = match self.poll_events(timeout) {
            Ok(batch) => batch,
            Err(err) if is_transient(&err) => {
                debug!(error = %err, "poll interrupted");
                Vec::new()
            }
            Err(err) => {
                error!(error = %err, detail = ?err, "poll failed");
                self.cycles.set(self.cycles.get() + 1);
                return 0;
            }
        };

        trace!(events = batch.len(), "dispatching");
        self.dispatch(&batch);
        self.cycles.set(self.cycles.get() + 1);
        batch.len()
    }

    fn poll_events(&self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let mut events = self.events.borrow_mut();
        self.backend.borrow_mut().poll(&mut events, timeout)?;

        let registry = self.registry.borrow();
        let mut batch = Vec::with_capacity(events.len());
        for event in &*events {
            match registry.resolve(event.fd) {
                Some(endpoint) => batch.push(ReadyEvent {
                    endpoint,
                    fd: event.fd,
                    readiness: event.readiness,
                }),
                None => {
                    error!(
                        fd = event.fd,
                        readiness = %event.readiness,
                        "event for unknown or dropped endpoint, discarding"
                    );
                }
            }
        }
        Ok(batch)
    }

    fn dispatch(&self, batch: &[ReadyEvent]) {
        let snapshot = self.handlers.borrow_mut().begin_cycle();
        let _iteration = IterationGuard {
            handlers: &self.handlers,
        };

        for (id, handler) in snapshot {
            if self.handlers.borrow().is_pending(id) {
                trace!(handler = %id, "skipping handler removed this cycle");
                continue;
            }
            let Ok(mut handler) = handler.try_borrow_mut() else {
                warn!(handler = %id, "handler already borrowed, skipping");
                continue;
            };
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle_events(self, batch)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(handler = %id, error = %err, detail = ?err, "handler failed");
                }
                Err(payload) => {
                    error!(
                        handler = %id,
                        panic = %panic_message(&*payload),
                        "handler panicked"
                    );
                }
            }
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// The backend variant selected at construction.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// True if `fd` has a registration.
    #[must_use]
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.borrow().contains(fd)
    }

    /// Number of handlers in the live list, pending removals included.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Number of reference handlers.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.handlers.borrow().reference_count()
    }

    /// True while at least one reference handler is registered.
    #[must_use]
    pub fn has_references(&self) -> bool {
        self.reference_count() > 0
    }

    /// Completed cycles, across all `run` and `run_once` calls.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.get()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("backend", &self.kind)
            .field("state", &self.state.get())
            .field("registered", &self.registered_count())
            .field("handlers", &self.handler_count())
            .field("references", &self.reference_count())
            .field("cycles", &self.cycles.get())
            .finish_non_exhaustive()
    }
}

/// Holds the loop in [`LoopState::Running`] for one `run`/`run_once` call.
struct RunGuard<'a> {
    state: &'a Cell<LoopState>,
}

impl<'a> RunGuard<'a> {
    fn enter(state: &'a Cell<LoopState>) -> Result<Self> {
        if state.get() == LoopState::Running {
            return Err(Error::AlreadyRunning);
        }
        state.set(LoopState::Running);
        Ok(Self { state })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.set(LoopState::Idle);
    }
}

/// Ends the dispatch section: flushes pending removals on every exit path.
struct IterationGuard<'a> {
    handlers: &'a RefCell<HandlerSet>,
}

impl Drop for IterationGuard<'_> {
    fn drop(&mut self) {
        match self.handlers.try_borrow_mut() {
            Ok(mut handlers) => {
                let removed = handlers.end_cycle();
                if removed > 0 {
                    trace!(removed, "flushed pending handler removals");
                }
            }
            Err(_) => {
                error!("handler list borrowed at end of cycle, removals not flushed");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
