//! A minimal counter entity, demonstrating `persist`, `persist_async` and recovery against an
//! in-memory journal.

use eventsourced::{
    effect::Effect, entity::EventSourcedExt, evt_log::LocalEvtLog, recovery::Recovery,
    snapshot_store::NoopSnapshotStore, EventSourced, JournalEntry, JournalEntryOutcome, SeqNo,
};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum Cmd {
    Inc(u64),
    Dec(u64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum Evt {
    Increased { old_value: u64, inc: u64 },
    Decreased { old_value: u64, dec: u64 },
}

#[derive(Debug, Clone, Copy, Error)]
enum CounterError {
    #[error("overflow: value={value}, increment={inc}")]
    Overflow { value: u64, inc: u64 },

    #[error("underflow: value={value}, decrement={dec}")]
    Underflow { value: u64, dec: u64 },
}

#[derive(Debug, Default)]
struct Counter;

impl EventSourced for Counter {
    type Id = Uuid;
    type Cmd = Cmd;
    type Evt = Evt;
    type State = u64;
    type Error = CounterError;

    const TYPE_NAME: &'static str = "counter";

    fn handle_command(
        _id: &Self::Id,
        effect: &mut Effect<'_, Self>,
        cmd: Self::Cmd,
    ) -> Result<(), Self::Error> {
        let value = *effect.state();
        match cmd {
            Cmd::Inc(inc) => {
                if inc > u64::MAX - value {
                    return Err(CounterError::Overflow { value, inc });
                }
                effect.persist(Evt::Increased { old_value: value, inc }, |_, evt| {
                    info!(?evt, "persisted");
                });
            }
            Cmd::Dec(dec) => {
                if dec > value {
                    return Err(CounterError::Underflow { value, dec });
                }
                effect.persist_async(Evt::Decreased { old_value: value, dec }, |_, evt| {
                    info!(?evt, "persisted");
                });
            }
        }
        Ok(())
    }

    fn apply_event(state: &mut Self::State, evt: &Self::Evt) {
        match *evt {
            Evt::Increased { inc, .. } => *state += inc,
            Evt::Decreased { dec, .. } => *state -= dec,
        }
    }
}

/// A toy journal good enough for this demo: one `Vec<Evt>` per entity ID, guarded by a mutex.
#[derive(Debug, Clone, Default)]
struct InMemoryEvtLog {
    entries: Arc<Mutex<HashMap<Uuid, Vec<Evt>>>>,
}

#[derive(Debug, Clone, Error)]
#[error("in-memory evt log error")]
struct InMemoryEvtLogError;

impl LocalEvtLog for InMemoryEvtLog {
    type Id = Uuid;
    type Evt = Evt;
    type Error = InMemoryEvtLogError;

    async fn write_batch(
        &self,
        id: &Self::Id,
        entries: Vec<JournalEntry<Self::Id, Self::Evt>>,
    ) -> Result<Vec<JournalEntryOutcome>, Self::Error> {
        let mut log = self.entries.lock().unwrap();
        let stored = log.entry(*id).or_default();
        let outcomes = entries
            .into_iter()
            .map(|entry| {
                if let JournalEntry::Write(records) = entry {
                    stored.extend(records.into_iter().map(|r| r.payload));
                }
                JournalEntryOutcome::Accepted
            })
            .collect();
        Ok(outcomes)
    }

    async fn replay(
        &self,
        id: &Self::Id,
        from: SeqNo,
        _to: Option<SeqNo>,
        _max: Option<u64>,
    ) -> Result<impl Stream<Item = Result<(SeqNo, Self::Evt), Self::Error>> + Send, Self::Error> {
        let log = self.entries.lock().unwrap();
        let evts: Vec<_> = log
            .get(id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, evt)| Ok((SeqNo::new(i as u64 + 1).unwrap(), evt)))
            .filter(move |r| matches!(r, Ok((seq_no, _)) if *seq_no >= from))
            .collect();
        Ok(stream::iter(evts))
    }

    async fn last_seq_no(&self, id: &Self::Id) -> Result<Option<SeqNo>, Self::Error> {
        let log = self.entries.lock().unwrap();
        let n = log.get(id).map(|v| v.len() as u64).unwrap_or(0);
        Ok(SeqNo::new(n).ok())
    }

    async fn delete_to(&self, _id: &Self::Id, _to_seq_no: SeqNo) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let evt_log = InMemoryEvtLog::default();
    let id = Uuid::now_v7();

    let entity = Counter::spawn(
        id,
        Recovery::new(),
        100,
        8,
        evt_log.clone(),
        NoopSnapshotStore::<Uuid, u64>::new(),
    )
    .await?;

    entity.handle_command(Cmd::Inc(3)).await??;
    entity.handle_command(Cmd::Inc(4)).await??;
    entity.handle_command(Cmd::Dec(2)).await??;

    info!("entity value after three commands: {:?}", evt_log.last_seq_no(&id).await);

    // Simulate a restart: drop this incarnation, spawn a fresh one against the same journal, and
    // confirm recovery replays every event to the same state.
    drop(entity);
    let entity = Counter::spawn(
        id,
        Recovery::new(),
        100,
        8,
        evt_log,
        NoopSnapshotStore::<Uuid, u64>::new(),
    )
    .await?;
    entity.handle_command(Cmd::Inc(1)).await??;

    Ok(())
}
