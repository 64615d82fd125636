//! Handler trait and the handler list lifecycle.
//!
//! The live list keeps registration order. Removals requested while a cycle
//! is dispatching are buffered in a pending set and applied only when the
//! cycle ends, so the order handlers run in within one cycle never shifts.
//! The reference set is updated immediately, so the loop's termination check
//! is never stale.

use super::{EventLoop, ReadyEvent};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Outcome of one handler invocation.
pub type HandlerResult = Result<(), Box<dyn std::error::Error>>;

/// Receives every event batch the loop dispatches.
///
/// Handlers are not routed per descriptor: each one sees the full batch of a
/// cycle and picks out what concerns it. A handler may call back into the
/// loop (register endpoints, add or remove handlers, itself included).
pub trait Handler {
    /// Processes one cycle's events.
    ///
    /// An `Err` is logged by the loop; the handler stays registered.
    fn handle_events(&mut self, lp: &EventLoop, events: &[ReadyEvent]) -> HandlerResult;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> Handler for FnHandler<F>
where
    F: FnMut(&EventLoop, &[ReadyEvent]) -> HandlerResult,
{
    fn handle_events(&mut self, lp: &EventLoop, events: &[ReadyEvent]) -> HandlerResult {
        (self.f)(lp, events)
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps a closure as a [`Handler`].
///
/// ```
/// use muxloop::{handler_fn, EventLoop, LoopConfig};
/// use muxloop::reactor::LabBackend;
///
/// let lp = EventLoop::with_backend(Box::new(LabBackend::new()), LoopConfig::default()).unwrap();
/// let id = lp.add_handler(handler_fn(|lp, _events| {
///     assert!(lp.has_references());
///     Ok(())
/// }), true);
/// assert_eq!(lp.handler_count(), 1);
/// lp.remove_handler(id).unwrap();
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&EventLoop, &[ReadyEvent]) -> HandlerResult + 'static,
{
    FnHandler { f }
}

/// Identity of a registered handler.
///
/// Ids increase monotonically per loop and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type SharedHandler = Rc<RefCell<dyn Handler>>;

/// Live handlers, reference set and pending removals.
#[derive(Default)]
pub(crate) struct HandlerSet {
    live: Vec<(HandlerId, SharedHandler)>,
    references: Vec<HandlerId>,
    pending: Vec<HandlerId>,
    iterating: bool,
    next_id: u64,
}

impl HandlerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, handler: SharedHandler, reference: bool) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.live.push((id, handler));
        if reference {
            self.references.push(id);
        }
        id
    }

    /// Drops `id` from the reference set now, and from the live list now or
    /// at the end of the current cycle.
    pub(crate) fn remove(&mut self, id: HandlerId) -> Result<()> {
        if !self.is_live(id) || self.is_pending(id) {
            return Err(Error::HandlerNotFound(id));
        }
        self.references.retain(|r| *r != id);
        if self.iterating {
            self.pending.push(id);
        } else {
            self.live.retain(|(live, _)| *live != id);
        }
        Ok(())
    }

    fn is_live(&self, id: HandlerId) -> bool {
        self.live.iter().any(|(live, _)| *live == id)
    }

    pub(crate) fn is_pending(&self, id: HandlerId) -> bool {
        self.pending.contains(&id)
    }

    /// Marks the set as iterating and returns the dispatch order for this cycle.
    pub(crate) fn begin_cycle(&mut self) -> Vec<(HandlerId, SharedHandler)> {
        self.iterating = true;
        self.live.clone()
    }

    /// Applies pending removals and clears the iterating mark.
    ///
    /// Returns the number of handlers removed.
    pub(crate) fn end_cycle(&mut self) -> usize {
        self.iterating = false;
        let pending = std::mem::take(&mut self.pending);
        let before = self.live.len();
        self.live.retain(|(id, _)| !pending.contains(id));
        before - self.live.len()
    }

    pub(crate) fn is_iterating(&self) -> bool {
        self.iterating
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn reference_count(&self) -> usize {
        self.references.len()
    }

    pub(crate) fn ids(&self) -> Vec<HandlerId> {
        self.live.iter().map(|(id, _)| *id).collect()
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("live", &self.ids())
            .field("references", &self.references)
            .field("pending", &self.pending)
            .field("iterating", &self.iterating)
            .finish()
    }
}
