//! The user-facing persistence API: [Effect], the handle passed into
//! [EventSourced::handle_command](crate::EventSourced::handle_command) and into persist handler
//! callbacks.

use crate::{
    pending::{BoxedHandler, PendingInvocation, PendingKind},
    EventSourced, SeqNo,
};
use std::{collections::VecDeque, sync::Arc};

/// An envelope accumulated in `event_batch` during one callback invocation, not yet stamped with
/// identity or a sequence number (that happens only when it is moved into a journal batch).
///
/// `Write` holds every event of one atomic write: a single event for `persist`/`persist_async`,
/// or the whole list for `persist_all`/`persist_all_async` — the journal must accept or reject
/// all of them together.
pub(crate) enum BatchEnvelope<E: EventSourced> {
    Write(Vec<E::Evt>),
    Loop(E::Evt),
}

/// The entity's persistent, run-loop-owned state: everything the write batcher and pending
/// invocation queue need, independent of which concrete `EvtLog`/`SnapshotStore` are in use.
pub(crate) struct EntityCore<E: EventSourced> {
    pub(crate) id: E::Id,
    pub(crate) writer_uuid: String,
    pub(crate) state: E::State,
    pub(crate) last_sequence_nr: Option<SeqNo>,
    pub(crate) sequence_nr: Option<SeqNo>,
    pub(crate) pending_invocations: VecDeque<PendingInvocation<E>>,
    pub(crate) pending_stashing_count: usize,
    pub(crate) event_batch: Vec<BatchEnvelope<E>>,
    pub(crate) max_message_batch_size: usize,
    /// Fire-and-forget delete, wired up at spawn time so `Effect` does not need to be generic
    /// over the concrete `EvtLog` implementation.
    pub(crate) delete: Arc<dyn Fn(SeqNo) + Send + Sync>,
}

impl<E: EventSourced> EntityCore<E> {
    pub(crate) fn next_sequence_nr(&mut self) -> SeqNo {
        let next = SeqNo::succ_of(self.sequence_nr);
        self.sequence_nr = Some(next);
        next
    }

    pub(crate) fn update_last_sequence_nr(&mut self, seq_no: SeqNo) {
        if self.last_sequence_nr.map(|n| seq_no > n).unwrap_or(true) {
            self.last_sequence_nr = Some(seq_no);
        }
    }
}

/// The handle through which [EventSourced::handle_command](crate::EventSourced::handle_command)
/// and persist handler callbacks emit events. Never held across an `.await` point: every method
/// here is a synchronous, non-blocking mutation of the entity's batching state.
pub struct Effect<'a, E: EventSourced> {
    pub(crate) core: &'a mut EntityCore<E>,
}

impl<'a, E: EventSourced> Effect<'a, E> {
    pub(crate) fn new(core: &'a mut EntityCore<E>) -> Self {
        Self { core }
    }

    /// The entity's identity.
    pub fn id(&self) -> &E::Id {
        &self.core.id
    }

    /// The entity's current state, as of the last applied event.
    pub fn state(&self) -> &E::State {
        &self.core.state
    }

    /// The highest sequence number observed so far (replayed or persisted).
    pub fn last_sequence_nr(&self) -> Option<SeqNo> {
        self.core.last_sequence_nr
    }

    /// Persists a single event. No further command is delivered to `handle_command` until
    /// `handler` has run.
    pub fn persist<H>(&mut self, evt: E::Evt, handler: H)
    where
        H: FnOnce(&mut Effect<'_, E>, &E::Evt) + Send + 'static,
    {
        self.push_one(PendingKind::Stashing, evt, Box::new(handler));
    }

    /// Persists an ordered, non-empty list of events as a single atomic write. `handler` is
    /// invoked once per event, in order. An empty `evts` is a no-op: no write, no handler calls,
    /// no state change.
    pub fn persist_all<H>(&mut self, evts: Vec<E::Evt>, handler: H)
    where
        H: Fn(&mut Effect<'_, E>, &E::Evt) + Send + Sync + 'static,
    {
        self.push_all(PendingKind::Stashing, evts, Arc::new(handler));
    }

    /// Persists a single event without stashing: further commands may be processed before
    /// `handler` runs.
    pub fn persist_async<H>(&mut self, evt: E::Evt, handler: H)
    where
        H: FnOnce(&mut Effect<'_, E>, &E::Evt) + Send + 'static,
    {
        self.push_one(PendingKind::Async, evt, Box::new(handler));
    }

    /// Batched, non-stashing variant of [persist_all](Self::persist_all).
    pub fn persist_all_async<H>(&mut self, evts: Vec<E::Evt>, handler: H)
    where
        H: Fn(&mut Effect<'_, E>, &E::Evt) + Send + Sync + 'static,
    {
        self.push_all(PendingKind::Async, evts, Arc::new(handler));
    }

    /// Defers `handler`, running it only after every persist submitted before this call has had
    /// its own handler invoked. If nothing is currently pending, `handler` runs immediately,
    /// synchronously, before this call returns.
    pub fn defer_async<H>(&mut self, payload: E::Evt, handler: H)
    where
        H: FnOnce(&mut Effect<'_, E>, &E::Evt) + Send + 'static,
    {
        if self.core.pending_invocations.is_empty() {
            handler(self, &payload);
            return;
        }
        self.core
            .pending_invocations
            .push_back(PendingInvocation::new(PendingKind::Async, Box::new(handler)));
        self.core.event_batch.push(BatchEnvelope::Loop(payload));
    }

    /// Fire-and-forget deletion of all events up to and including `to_seq_no`.
    pub fn delete_messages(&mut self, to_seq_no: SeqNo) {
        (self.core.delete)(to_seq_no);
    }

    fn push_one(&mut self, kind: PendingKind, evt: E::Evt, handler: BoxedHandler<E>) {
        if kind == PendingKind::Stashing {
            self.core.pending_stashing_count += 1;
        }
        self.core
            .pending_invocations
            .push_back(PendingInvocation::new(kind, handler));
        self.core.event_batch.push(BatchEnvelope::Write(vec![evt]));
    }

    /// Pushes one atomic write covering every event in `evts`, with one pending invocation per
    /// event so each gets its own handler call, in order, once the write is acknowledged.
    fn push_all<H>(&mut self, kind: PendingKind, evts: Vec<E::Evt>, handler: Arc<H>)
    where
        H: Fn(&mut Effect<'_, E>, &E::Evt) + Send + Sync + 'static,
    {
        if evts.is_empty() {
            return;
        }
        if kind == PendingKind::Stashing {
            self.core.pending_stashing_count += evts.len();
        }
        for _ in &evts {
            let handler = handler.clone();
            let boxed: BoxedHandler<E> = Box::new(move |effect, evt| handler(effect, evt));
            self.core
                .pending_invocations
                .push_back(PendingInvocation::new(kind, boxed));
        }
        self.core.event_batch.push(BatchEnvelope::Write(evts));
    }
}
