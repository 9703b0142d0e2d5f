//! The FIFO queue of events awaiting confirmation from the journal.

use crate::effect::Effect;
use crate::EventSourced;

/// Whether a pending invocation came from a stashing (`persist`/`persist_all`) or non-stashing
/// (`persist_async`/`persist_all_async`/`defer_async`) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Stashing,
    Async,
}

/// A handler callback runs synchronously with a context it can use to read the (already updated)
/// state, or to persist further events reentrantly — it never receives state by value, so there
/// is no aliasing conflict in borrowing the entity's core mutably to build the [Effect].
pub type BoxedHandler<E> =
    Box<dyn FnOnce(&mut Effect<'_, E>, &<E as EventSourced>::Evt) + Send>;

/// One event and its follow-up handler, awaiting the journal's reply.
pub struct PendingInvocation<E: EventSourced> {
    pub kind: PendingKind,
    handler: BoxedHandler<E>,
}

impl<E: EventSourced> PendingInvocation<E> {
    pub fn new(kind: PendingKind, handler: BoxedHandler<E>) -> Self {
        Self { kind, handler }
    }

    /// Runs the handler. Consumes the invocation: a handler runs at most once.
    pub fn invoke(self, effect: &mut Effect<'_, E>, evt: &E::Evt) {
        (self.handler)(effect, evt)
    }
}
