//! Parameters controlling how an entity recovers its state before serving its first command.

use crate::SeqNo;

/// Whether to attempt loading a snapshot before replaying events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotSelection {
    /// Load the latest snapshot, if any.
    #[default]
    Latest,
    /// Skip the snapshot store entirely and replay from the beginning of the journal.
    None,
}

/// Parameters for an entity's recovery: snapshot selection, an optional upper bound on replayed
/// sequence numbers, and an optional cap on the number of events replayed.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub from_snapshot: SnapshotSelection,
    pub to_sequence_nr: Option<SeqNo>,
    pub replay_max: Option<u64>,
}

impl Recovery {
    /// The default recovery: latest snapshot, unbounded sequence number, unbounded replay count.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_to_sequence_nr(mut self, to_sequence_nr: SeqNo) -> Self {
        self.to_sequence_nr = Some(to_sequence_nr);
        self
    }

    pub fn with_replay_max(mut self, replay_max: u64) -> Self {
        self.replay_max = Some(replay_max);
        self
    }

    pub fn without_snapshot(mut self) -> Self {
        self.from_snapshot = SnapshotSelection::None;
        self
    }
}
