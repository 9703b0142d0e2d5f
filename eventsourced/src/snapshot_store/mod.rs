//! The snapshot store: a pluggable, keyed store of serialized entity state plus sequence number.

mod noop;

pub use noop::*;

use crate::SeqNo;
use std::{error::Error as StdError, fmt::Debug};

/// Snapshot state along with the sequence number it was taken at.
#[derive(Debug, Clone)]
pub struct Snapshot<State> {
    pub seq_no: SeqNo,
    pub state: State,
}

impl<State> Snapshot<State> {
    pub fn new(seq_no: SeqNo, state: State) -> Self {
        Self { seq_no, state }
    }
}

/// Persistence for snapshots: a pluggable, keyed store of serialized entity state.
///
/// Corresponds to the `LoadSnapshot`/`LoadSnapshotResult` message protocol for loading, plus a
/// `save` operation used to periodically checkpoint state (mirroring the teacher crate's
/// `snapshot_after` counter).
#[trait_variant::make(SnapshotStore: Send)]
pub trait LocalSnapshotStore: Clone + 'static {
    /// The entity identity type used as a key into the snapshot store.
    type Id: Debug + Clone + Send + Sync + 'static;

    /// The entity state type this store snapshots. Fixed per implementation, for the same reason
    /// [crate::evt_log::LocalEvtLog::Evt] is: a real backing store picks one serialization
    /// strategy for it at construction time rather than per call.
    type State: Debug + Send + Sync + 'static;

    type Error: StdError + Send + Sync + 'static;

    /// Saves the given snapshot state for the given entity ID and sequence number.
    async fn save(&self, id: &Self::Id, seq_no: SeqNo, state: &Self::State) -> Result<(), Self::Error>;

    /// Finds and possibly loads the latest [Snapshot] for the given entity ID.
    async fn load(&self, id: &Self::Id) -> Result<Option<Snapshot<Self::State>>, Self::Error>;
}
