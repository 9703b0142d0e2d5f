//! [EvtLog](eventsourced::EvtLog) and [SnapshotStore](eventsourced::SnapshotStore) implementations
//! based upon [NATS](https://nats.io/) JetStream.

mod evt_log;
mod snapshot_store;

pub use evt_log::{Config as NatsEvtLogConfig, NatsEvtLog};
pub use snapshot_store::{Config as NatsSnapshotStoreConfig, NatsSnapshotStore};

use eventsourced::ZeroSeqNoError;
use thiserror::Error;

/// Errors from the [NatsEvtLog] or [NatsSnapshotStore].
#[derive(Debug, Error)]
pub enum Error {
    #[error("NATS error: {0}")]
    Nats(String, #[source] Box<dyn std::error::Error + Send + Sync>),

    /// An event cannot be converted to bytes.
    #[error("cannot convert event to bytes")]
    EvtToBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Bytes cannot be converted to an event.
    #[error("cannot convert bytes to event")]
    EvtFromBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Snapshot state cannot be converted to bytes.
    #[error("cannot convert snapshot state to bytes")]
    StateToBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Bytes cannot be converted to snapshot state.
    #[error("cannot convert bytes to snapshot state")]
    StateFromBytes(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// A stored snapshot entry is shorter than the sequence number header.
    #[error("malformed snapshot entry")]
    MalformedSnapshot,

    /// Invalid sequence number read back from NATS.
    #[error("invalid sequence number")]
    InvalidSeqNo(#[source] ZeroSeqNoError),
}

#[cfg(test)]
pub mod tests {
    pub const NATS_VERSION: &str = "2.10";
}
