//! Errors surfaced by [spawn](crate::EventSourcedExt::spawn) and [EntityRef].

use thiserror::Error;

/// Errors from spawning an event sourced entity.
#[derive(Debug, Error)]
pub enum SpawnError<SnapshotStoreError, EvtLogError>
where
    SnapshotStoreError: std::error::Error + Send + Sync + 'static,
    EvtLogError: std::error::Error + Send + Sync + 'static,
{
    /// A snapshot cannot be loaded from the snapshot store.
    #[error("cannot load snapshot from snapshot store")]
    LoadSnapshot(#[source] SnapshotStoreError),

    /// The last sequence number cannot be obtained from the journal.
    #[error("cannot get last sequence number from journal")]
    LastSeqNo(#[source] EvtLogError),

    /// Events cannot be replayed from the journal.
    #[error("cannot replay events from journal")]
    Replay(#[source] EvtLogError),
}

/// A command cannot be sent from an [EntityRef](crate::EntityRef) to its entity, or the result
/// cannot be received from it (typically because the entity has stopped).
#[derive(Debug, Error)]
pub enum HandleCommandError {
    #[error("cannot send command to entity")]
    Send,

    #[error("entity terminated before a reply could be received")]
    EntityTerminated,
}
