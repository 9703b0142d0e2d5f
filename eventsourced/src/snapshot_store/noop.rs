use crate::{snapshot_store::Snapshot, SeqNo};
use std::{convert::Infallible, fmt::Debug, marker::PhantomData};

/// A [SnapshotStore](super::SnapshotStore) that never stores anything: [load](Self::load) always
/// returns `None`, forcing full replay from the beginning of the journal on every spawn. Useful
/// for entities that are cheap to replay in full, or for tests.
#[derive(Debug, Clone, Default)]
pub struct NoopSnapshotStore<Id, State>(PhantomData<(Id, State)>);

impl<Id, State> NoopSnapshotStore<Id, State> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<Id, State> super::LocalSnapshotStore for NoopSnapshotStore<Id, State>
where
    Id: Debug + Clone + Send + Sync + 'static,
    State: Debug + Send + Sync + 'static,
{
    type Id = Id;
    type State = State;
    type Error = Infallible;

    async fn save(&self, _id: &Self::Id, _seq_no: SeqNo, _state: &Self::State) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn load(&self, _id: &Self::Id) -> Result<Option<Snapshot<Self::State>>, Self::Error> {
        Ok(None)
    }
}
