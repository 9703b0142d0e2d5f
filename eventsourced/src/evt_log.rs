//! The journal: a pluggable, append-only, ordered log of persistent events per entity.

use crate::SeqNo;
use futures::Stream;
use std::{error::Error as StdError, fmt::Debug};

/// A record finalized at flush time: its `persistence_id` and `seq_no` are stamped only once it
/// is moved from the entity's `event_batch` into a `journal_batch` (see [crate::effect::Effect]).
#[derive(Debug, Clone)]
pub struct PersistentRepr<Id, Evt> {
    pub persistence_id: Id,
    pub seq_no: SeqNo,
    pub writer_uuid: String,
    pub payload: Evt,
}

/// One entry submitted to the journal in a [EvtLog::write_batch] call.
///
/// A `Write` is an atomic write of one or more records (all-or-nothing durability). A `Loop` is
/// [crate::effect::Effect::defer_async]'s non-persistent payload, looped back through the journal
/// only to preserve FIFO ordering with surrounding persists; it is never actually stored.
#[derive(Debug, Clone)]
pub enum JournalEntry<Id, Evt> {
    Write(Vec<PersistentRepr<Id, Evt>>),
    Loop(Evt),
}

/// The per-entry reply to a [EvtLog::write_batch] call, in submission order.
#[derive(Debug, Clone)]
pub enum JournalEntryOutcome {
    /// The entry was durably written (or, for a `Loop` entry, simply acknowledged).
    Accepted,
    /// The journal rejected the entry as invalid. This is a logical failure, not an
    /// infrastructure failure: the entity continues running.
    Rejected(Rejection),
}

/// The journal's reason for rejecting a [JournalEntry::Write].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct Rejection(pub String);

/// Persistence for events: a pluggable, append-only, ordered log per entity.
///
/// Corresponds to the `WriteMessages`/`ReplayMessages`/`DeleteMessagesTo` message protocol: each
/// method here is one async request/reply round trip with the underlying store.
#[trait_variant::make(EvtLog: Send)]
pub trait LocalEvtLog: Clone + 'static {
    /// The entity identity type used as a partition key into the journal.
    type Id: Debug + Clone + Send + Sync + 'static;

    /// The event type this journal stores. Fixed per implementation (rather than a per-call
    /// generic) so that a concrete store backed by real I/O can pick one serialization strategy
    /// for it up front, instead of needing a codec argument on every call.
    type Evt: Debug + Clone + Send + Sync + 'static;

    /// Infrastructure errors: connection failures, I/O errors. Distinct from a logical
    /// [Rejection], which is carried inside a successful [JournalEntryOutcome] instead.
    type Error: StdError + Send + Sync + 'static;

    /// Submits a batch of entries for the given entity in one round trip, returning one outcome
    /// per entry, in submission order. `Err` denotes the whole batch failing for infrastructure
    /// reasons (durability of every entry in the batch becomes unknown).
    async fn write_batch(
        &self,
        id: &Self::Id,
        entries: Vec<JournalEntry<Self::Id, Self::Evt>>,
    ) -> Result<Vec<JournalEntryOutcome>, Self::Error>;

    /// Streams previously written events for the given entity, starting at `from` (inclusive),
    /// ending at `to` (inclusive) if given, yielding at most `max` events if given.
    async fn replay(
        &self,
        id: &Self::Id,
        from: SeqNo,
        to: Option<SeqNo>,
        max: Option<u64>,
    ) -> Result<impl Stream<Item = Result<(SeqNo, Self::Evt), Self::Error>> + Send, Self::Error>;

    /// The highest sequence number written for the given entity, or `None` if none has been
    /// written yet.
    async fn last_seq_no(&self, id: &Self::Id) -> Result<Option<SeqNo>, Self::Error>;

    /// Deletes all events up to and including `to_seq_no`. Fire-and-forget from the entity's
    /// perspective: failures are reported via [crate::EventSourced::on_delete_messages_failure]
    /// rather than propagated to the caller of [crate::effect::Effect::delete_messages].
    async fn delete_to(&self, id: &Self::Id, to_seq_no: SeqNo) -> Result<(), Self::Error>;
}
