#![cfg_attr(docsrs, feature(doc_cfg))]

//! Event sourced entities.
//!
//! EventSourced is inspired to a large degree by the amazing
//! [Akka Persistence](https://doc.akka.io/docs/akka/current/typed/index-persistence.html) library.
//! It provides a framework for implementing
//! [Event Sourcing](https://martinfowler.com/eaaDev/EventSourcing.html) and
//! [CQRS](https://www.martinfowler.com/bliki/CQRS.html).
//!
//! An entity is a single-task state machine sitting between a command handler and a pluggable,
//! append-only [EvtLog]: commands produce events via [EventSourced::handle_command], events are
//! folded into state via [EventSourced::apply_event], and the [Effect] handle threaded through the
//! command handler is the only way to request that an event be durably written. For
//! [NATS](https://nats.io/) and [Postgres](https://www.postgresql.org/), `EvtLog` and
//! `SnapshotStore` implementations live in the `eventsourced-nats` and `eventsourced-postgres`
//! crates respectively.
//!
//! [spawn](EventSourcedExt::spawn) creates an event sourced entity, identified by an ID, backed by
//! some [EvtLog] and some [SnapshotStore]. It first recovers the entity (restoring a snapshot, then
//! replaying events), then returns a cloneable [EntityRef] used to send it commands via
//! [handle_command](EntityRef::handle_command).
//!
//! `persist`/`persist_all` on [Effect] stash further commands until the write completes and their
//! handler has run; `persist_async`/`persist_all_async`/`defer_async` do not stash, allowing
//! commands to interleave with in-flight writes. See [Effect] for the full API and its ordering
//! guarantees.

pub mod binarize;
pub mod effect;
pub mod entity;
pub mod error;
pub mod evt_log;
pub mod pending;
pub mod recovery;
pub mod seq_no;
pub mod snapshot_store;

pub use effect::Effect;
pub use entity::{EntityRef, EventSourcedExt};
pub use error::{HandleCommandError, SpawnError};
pub use evt_log::{EvtLog, JournalEntry, JournalEntryOutcome, LocalEvtLog, PersistentRepr, Rejection};
pub use recovery::{Recovery, SnapshotSelection};
pub use seq_no::{SeqNo, ZeroSeqNoError};
pub use snapshot_store::{LocalSnapshotStore, NoopSnapshotStore, Snapshot, SnapshotStore};

use std::{error::Error as StdError, fmt::Debug};

/// Command and event handling for an event sourced entity.
///
/// An implementation names four types (identity, command, event, state) and two pure-ish
/// functions: [handle_command](Self::handle_command) decides, given a command and the entity's
/// current state, what to persist (if anything), by calling methods on the given [Effect].
/// [apply_event](Self::apply_event) folds one persisted event into state; it is used both during
/// replay and immediately after a successful write, before any persist handler runs.
pub trait EventSourced: Sized + Send + Sync + 'static {
    /// Id type, used as the partition key into the [EvtLog] and [SnapshotStore].
    type Id: Debug + Clone + Send + Sync + 'static;

    /// Command type.
    type Cmd: Debug + Send + 'static;

    /// Event type.
    type Evt: Debug + Clone + Send + Sync + 'static;

    /// State type.
    type State: Debug + Default + Send + Sync + 'static;

    /// Error type for rejected (i.e. invalid) commands, returned from
    /// [handle_command](Self::handle_command).
    type Error: StdError + Send + Sync + 'static;

    /// A short, stable name for this entity type, used to namespace writer identity.
    const TYPE_NAME: &'static str;

    /// Command handler: inspects `cmd` against the entity's current state (via `effect.state()`)
    /// and calls `effect.persist`/`persist_async`/etc. to request events be written, or returns
    /// `Err` to reject the command without any effect on the event log or state.
    fn handle_command(
        id: &Self::Id,
        effect: &mut Effect<'_, Self>,
        cmd: Self::Cmd,
    ) -> Result<(), Self::Error>;

    /// Event handler: folds one persisted event into `state`. Used during replay and, for each
    /// newly written event, immediately before that event's persist handler runs.
    fn apply_event(state: &mut Self::State, evt: &Self::Evt);

    /// Called once recovery (snapshot load plus replay) has completed and the entity is about to
    /// start serving commands.
    #[allow(unused_variables)]
    fn on_recovery_completed(id: &Self::Id, state: &Self::State) {}

    /// Called when the journal cannot be replayed during recovery. The entity does not spawn;
    /// [spawn](EventSourcedExt::spawn) returns the underlying error.
    fn on_replay_failure(id: &Self::Id, cause: &(dyn StdError + 'static)) {
        tracing::error!(?id, %cause, "replay failed");
    }

    /// Called when the journal rejects an event as invalid (a logical, non-fatal failure): the
    /// entity keeps running, but the event was never durably written and its persist handler
    /// never runs.
    #[allow(unused_variables)]
    fn on_persist_rejected(id: &Self::Id, cause: &Rejection, evt: &Self::Evt, seq_no: SeqNo) {
        tracing::warn!(?id, %cause, ?evt, %seq_no, "persist rejected");
    }

    /// Called when a write fails for infrastructure reasons (a fatal failure): the entity stops
    /// right after this call, without invoking the corresponding persist handler.
    #[allow(unused_variables)]
    fn on_persist_failure(
        id: &Self::Id,
        cause: &(dyn StdError + 'static),
        evt: &Self::Evt,
        seq_no: SeqNo,
    ) {
        tracing::error!(?id, %cause, ?evt, %seq_no, "persist failed, stopping entity");
    }

    /// Called when [Effect::delete_messages]'s fire-and-forget deletion fails.
    fn on_delete_messages_failure(id: &Self::Id, cause: &(dyn StdError + 'static), to_seq_no: SeqNo) {
        tracing::error!(?id, %cause, %to_seq_no, "delete messages failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evt_log::JournalEntry;
    use futures::{stream, Stream};
    use std::{
        collections::{HashMap, VecDeque},
        convert::Infallible,
        sync::{Arc, Mutex},
    };
    use tokio::sync::oneshot;
    use tracing_test::traced_test;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    enum CounterCmd {
        Increment(u64),
        IncrementAsync(u64),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Incremented(u64);

    #[derive(Debug, Default, PartialEq, Eq)]
    struct Counter;

    impl EventSourced for Counter {
        type Id = Uuid;
        type Cmd = CounterCmd;
        type Evt = Incremented;
        type State = u64;
        type Error = Infallible;

        const TYPE_NAME: &'static str = "counter";

        fn handle_command(
            _id: &Self::Id,
            effect: &mut Effect<'_, Self>,
            cmd: Self::Cmd,
        ) -> Result<(), Self::Error> {
            match cmd {
                CounterCmd::Increment(n) => {
                    effect.persist(Incremented(n), |_, _| {});
                }
                CounterCmd::IncrementAsync(n) => {
                    effect.persist_async(Incremented(n), |_, _| {});
                }
            }
            Ok(())
        }

        fn apply_event(state: &mut Self::State, evt: &Self::Evt) {
            *state += evt.0;
        }
    }

    #[derive(Debug, Clone, Default)]
    struct InMemoryEvtLog {
        entries: Arc<Mutex<HashMap<Uuid, Vec<Incremented>>>>,
    }

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("in-memory evt log error")]
    struct InMemoryEvtLogError;

    impl evt_log::LocalEvtLog for InMemoryEvtLog {
        type Id = Uuid;
        type Evt = Incremented;
        type Error = InMemoryEvtLogError;

        async fn write_batch(
            &self,
            id: &Self::Id,
            entries: Vec<JournalEntry<Self::Id, Self::Evt>>,
        ) -> Result<Vec<JournalEntryOutcome>, Self::Error> {
            let mut outcomes = Vec::with_capacity(entries.len());
            let mut log = self.entries.lock().unwrap();
            let stored = log.entry(*id).or_default();
            for entry in entries {
                match entry {
                    JournalEntry::Write(records) => {
                        for record in &records {
                            stored.push(record.payload.clone());
                        }
                        outcomes.push(JournalEntryOutcome::Accepted);
                    }
                    JournalEntry::Loop(_) => outcomes.push(JournalEntryOutcome::Accepted),
                }
            }
            Ok(outcomes)
        }

        async fn replay(
            &self,
            id: &Self::Id,
            from: SeqNo,
            _to: Option<SeqNo>,
            _max: Option<u64>,
        ) -> Result<impl Stream<Item = Result<(SeqNo, Self::Evt), Self::Error>> + Send, Self::Error>
        {
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

    #[tokio::test]
    #[traced_test]
    async fn test_spawn_and_handle_command() {
        let evt_log = InMemoryEvtLog::default();
        let snapshot_store = NoopSnapshotStore::<Uuid, u64>::default();

        let entity = Counter::spawn(
            Uuid::from_u128(1),
            Recovery::new(),
            100,
            8,
            evt_log,
            snapshot_store,
        )
        .await
        .expect("spawn succeeds");

        entity
            .handle_command(CounterCmd::Increment(1))
            .await
            .expect("sent")
            .expect("accepted");

        entity
            .handle_command(CounterCmd::IncrementAsync(2))
            .await
            .expect("sent")
            .expect("accepted");

        assert!(logs_contain("persisting"));
    }

    /// A [SnapshotStore] that always returns the same, test-supplied snapshot (or none).
    #[derive(Debug, Clone)]
    struct FixedSnapshotStore<State> {
        snapshot: Option<Snapshot<State>>,
    }

    impl<State> snapshot_store::LocalSnapshotStore for FixedSnapshotStore<State>
    where
        State: Debug + Clone + Send + Sync + 'static,
    {
        type Id = Uuid;
        type State = State;
        type Error = Infallible;

        async fn save(&self, _id: &Self::Id, _seq_no: SeqNo, _state: &Self::State) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn load(&self, _id: &Self::Id) -> Result<Option<Snapshot<Self::State>>, Self::Error> {
            Ok(self.snapshot.clone())
        }
    }

    #[tokio::test]
    async fn test_recovery_replays_events_after_snapshot() {
        let evt_log = InMemoryEvtLog::default();
        let id = Uuid::from_u128(20);

        // Pre-populate five events directly, bypassing a live entity, as if written by an earlier
        // incarnation.
        let records = (1..=5u64)
            .map(|n| PersistentRepr {
                persistence_id: id,
                seq_no: SeqNo::new(n).unwrap(),
                writer_uuid: "writer-pre".to_string(),
                payload: Incremented(1),
            })
            .collect();
        evt_log
            .write_batch(&id, vec![JournalEntry::Write(records)])
            .await
            .expect("pre-population accepted");

        // A snapshot taken at seq_no 3, covering the first three increments.
        let snapshot_store = FixedSnapshotStore {
            snapshot: Some(Snapshot::new(SeqNo::new(3).unwrap(), 3u64)),
        };

        let entity = Counter::spawn(id, Recovery::new(), 100, 8, evt_log.clone(), snapshot_store)
            .await
            .expect("spawn succeeds");

        // The next persisted event must be assigned seq_no 6: recovery replayed events 4 and 5 on
        // top of the snapshot's seq_no 3, so sequence_nr picked up at 5.
        entity
            .handle_command(CounterCmd::Increment(10))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(evt_log.last_seq_no(&id).await.unwrap(), Some(SeqNo::new(6).unwrap()));
    }

    /// An action a [TraceCmd] can request of an [Effect], named after the five user-facing
    /// persistence operations this state machine exists to get right.
    #[derive(Debug, Clone)]
    enum TraceAction {
        PersistStash(String),
        PersistAsync(String),
        PersistAllStash(Vec<String>),
        PersistAllAsync(Vec<String>),
        DeferAsync(String),
        /// Records the entity's current state (a count of applied events) into the trace, to
        /// observe whether a given event was ever folded into state.
        Inspect,
    }

    /// A command carrying its own trace sink, so a test can assert the exact interleaving of
    /// `cmd:*` (command handler ran) and `handler:*` (persist handler ran) markers without any
    /// timing assumptions.
    struct TraceCmd {
        label: String,
        actions: Vec<TraceAction>,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Debug for TraceCmd {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TraceCmd")
                .field("label", &self.label)
                .field("actions", &self.actions)
                .finish()
        }
    }

    fn trace_cmd(label: &str, actions: Vec<TraceAction>, trace: &Arc<Mutex<Vec<String>>>) -> TraceCmd {
        TraceCmd {
            label: label.to_string(),
            actions,
            trace: trace.clone(),
        }
    }

    #[derive(Debug, Default)]
    struct TraceEntity;

    impl EventSourced for TraceEntity {
        type Id = Uuid;
        type Cmd = TraceCmd;
        type Evt = String;
        type State = u64;
        type Error = Infallible;

        const TYPE_NAME: &'static str = "trace";

        fn handle_command(
            _id: &Self::Id,
            effect: &mut Effect<'_, Self>,
            cmd: Self::Cmd,
        ) -> Result<(), Self::Error> {
            cmd.trace.lock().unwrap().push(format!("cmd:{}", cmd.label));
            for action in cmd.actions {
                match action {
                    TraceAction::PersistStash(evt) => {
                        let trace = cmd.trace.clone();
                        effect.persist(evt, move |_, evt| {
                            trace.lock().unwrap().push(format!("handler:{evt}"));
                        });
                    }
                    TraceAction::PersistAsync(evt) => {
                        let trace = cmd.trace.clone();
                        effect.persist_async(evt, move |_, evt| {
                            trace.lock().unwrap().push(format!("handler:{evt}"));
                        });
                    }
                    TraceAction::PersistAllStash(evts) => {
                        let trace = cmd.trace.clone();
                        effect.persist_all(evts, move |_, evt| {
                            trace.lock().unwrap().push(format!("handler:{evt}"));
                        });
                    }
                    TraceAction::PersistAllAsync(evts) => {
                        let trace = cmd.trace.clone();
                        effect.persist_all_async(evts, move |_, evt| {
                            trace.lock().unwrap().push(format!("handler:{evt}"));
                        });
                    }
                    TraceAction::DeferAsync(evt) => {
                        let trace = cmd.trace.clone();
                        effect.defer_async(evt, move |_, evt| {
                            trace.lock().unwrap().push(format!("handler:{evt}"));
                        });
                    }
                    TraceAction::Inspect => {
                        cmd.trace.lock().unwrap().push(format!("state:{}", effect.state()));
                    }
                }
            }
            Ok(())
        }

        fn apply_event(state: &mut Self::State, _evt: &Self::Evt) {
            *state += 1;
        }
    }

    #[derive(Debug, Clone, thiserror::Error)]
    #[error("gated evt log error")]
    struct GatedEvtLogError;

    /// An [EvtLog] whose [write_batch](LocalEvtLog::write_batch) calls can be held open (via a
    /// queue of gates, one per call) and whose outcomes or failure can be overridden, so tests can
    /// pin down exactly when a write completes and how the journal responds to it.
    #[derive(Clone, Default)]
    struct GatedEvtLog {
        stored: Arc<Mutex<HashMap<Uuid, Vec<String>>>>,
        gates: Arc<Mutex<VecDeque<oneshot::Receiver<()>>>>,
        outcomes: Arc<Mutex<VecDeque<Vec<JournalEntryOutcome>>>>,
        fail_next: Arc<Mutex<VecDeque<()>>>,
        batch_sizes: Arc<Mutex<Vec<usize>>>,
    }

    impl GatedEvtLog {
        fn push_gate(&self, gate: oneshot::Receiver<()>) {
            self.gates.lock().unwrap().push_back(gate);
        }

        fn push_outcome(&self, outcome: Vec<JournalEntryOutcome>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn push_failure(&self) {
            self.fail_next.lock().unwrap().push_back(());
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batch_sizes.lock().unwrap().clone()
        }
    }

    impl evt_log::LocalEvtLog for GatedEvtLog {
        type Id = Uuid;
        type Evt = String;
        type Error = GatedEvtLogError;

        async fn write_batch(
            &self,
            id: &Self::Id,
            entries: Vec<JournalEntry<Self::Id, Self::Evt>>,
        ) -> Result<Vec<JournalEntryOutcome>, Self::Error> {
            self.batch_sizes.lock().unwrap().push(entries.len());

            // Held until the test releases it, so the entity's write-in-progress window can be
            // observed and acted on from outside.
            if let Some(gate) = self.gates.lock().unwrap().pop_front() {
                let _ = gate.await;
            }

            if self.fail_next.lock().unwrap().pop_front().is_some() {
                return Err(GatedEvtLogError);
            }

            let overridden = self.outcomes.lock().unwrap().pop_front();
            let mut stored = self.stored.lock().unwrap();
            let log = stored.entry(*id).or_default();
            let mut outcomes = Vec::with_capacity(entries.len());
            for (i, entry) in entries.into_iter().enumerate() {
                match (entry, overridden.as_ref().and_then(|o| o.get(i).cloned())) {
                    (JournalEntry::Write(_), Some(rejected @ JournalEntryOutcome::Rejected(_))) => {
                        outcomes.push(rejected);
                    }
                    (JournalEntry::Write(records), _) => {
                        log.extend(records.into_iter().map(|r| r.payload));
                        outcomes.push(JournalEntryOutcome::Accepted);
                    }
                    (JournalEntry::Loop(_), _) => outcomes.push(JournalEntryOutcome::Accepted),
                }
            }
            Ok(outcomes)
        }

        async fn replay(
            &self,
            id: &Self::Id,
            from: SeqNo,
            _to: Option<SeqNo>,
            _max: Option<u64>,
        ) -> Result<impl Stream<Item = Result<(SeqNo, Self::Evt), Self::Error>> + Send, Self::Error>
        {
            let log = self.stored.lock().unwrap();
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
            let log = self.stored.lock().unwrap();
            let n = log.get(id).map(|v| v.len() as u64).unwrap_or(0);
            Ok(SeqNo::new(n).ok())
        }

        async fn delete_to(&self, _id: &Self::Id, _to_seq_no: SeqNo) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    async fn spawn_trace_entity(id: Uuid, evt_log: GatedEvtLog) -> EntityRef<TraceEntity> {
        TraceEntity::spawn(id, Recovery::new(), 100, 8, evt_log, NoopSnapshotStore::<Uuid, u64>::default())
            .await
            .expect("spawn succeeds")
    }

    async fn spawn_trace_entity_with_batch_size(
        id: Uuid,
        evt_log: GatedEvtLog,
        max_message_batch_size: usize,
    ) -> EntityRef<TraceEntity> {
        TraceEntity::spawn(
            id,
            Recovery::new(),
            100,
            max_message_batch_size,
            evt_log,
            NoopSnapshotStore::<Uuid, u64>::default(),
        )
        .await
        .expect("spawn succeeds")
    }

    // Scenario 1 (§8): pure async. A command received while a persist_async write is still
    // in-flight is processed before that write's handlers run.
    #[tokio::test]
    async fn test_persist_async_interleaves_with_later_commands() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);

        let entity = spawn_trace_entity(Uuid::from_u128(30), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAsync("a".into()), TraceAction::PersistAsync("b".into())],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        // c1's write is held open by the gate; c2 must still be processed right away.
        entity
            .handle_command(trace_cmd("c2", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "cmd:c2"]);

        release.send(()).expect("write still awaiting the gate");

        // c3 cannot be processed until the write completes and runs behind it in the mailbox, so
        // awaiting it proves both a's and b's handlers have already run.
        entity
            .handle_command(trace_cmd("c3", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "cmd:c2", "handler:a", "handler:b", "cmd:c3"]
        );
    }

    // Scenario 2 (§8): pure stashing. A command received while a `persist` write is in-flight is
    // stashed until that write's handler has run.
    #[tokio::test]
    async fn test_persist_stashes_commands_until_its_handler_runs() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);

        let entity = spawn_trace_entity(Uuid::from_u128(31), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd("c1", vec![TraceAction::PersistStash("x".into())], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        // c2 cannot complete until the entity leaves the persisting-events state, so it must run
        // on its own task while the write is held open.
        let c2 = tokio::spawn({
            let entity = entity.clone();
            let trace = trace.clone();
            async move { entity.handle_command(trace_cmd("c2", vec![], &trace)).await }
        });

        release.send(()).expect("write still awaiting the gate");

        c2.await
            .expect("task did not panic")
            .expect("sent")
            .expect("accepted");

        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "handler:x", "cmd:c2"]);
    }

    // Scenario 3 (§8): mixed. A persist_async followed by a persist in the same command produces
    // two separate atomic writes, because the pending-stashing persist must not be coalesced with
    // prior async writes.
    #[tokio::test]
    async fn test_mixed_persist_and_persist_async_flush_separately() {
        let evt_log = GatedEvtLog::default();
        let entity = spawn_trace_entity(Uuid::from_u128(32), evt_log.clone()).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAsync("p".into()), TraceAction::PersistStash("q".into())],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        // c2 can only run once pendingStashingCount has dropped back to zero, i.e. after q's
        // handler, which in turn only runs after p's write has already completed and its handler
        // has run (handlers fire in submission order).
        entity
            .handle_command(trace_cmd("c2", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "handler:p", "handler:q", "cmd:c2"]
        );
        assert_eq!(evt_log.batch_sizes(), vec![1, 1]);
    }

    // `persist_all`: an ordered, non-empty list of events is written as a single atomic batch,
    // with one handler invocation per event, in submission order, and commands stash until the
    // last of those handlers has run.
    #[tokio::test]
    async fn test_persist_all_writes_one_batch_and_invokes_handler_per_event_in_order() {
        let evt_log = GatedEvtLog::default();
        let entity = spawn_trace_entity(Uuid::from_u128(35), evt_log.clone()).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAllStash(vec!["a".into(), "b".into(), "c".into()])],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        entity
            .handle_command(trace_cmd("c2", vec![TraceAction::Inspect], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "handler:a", "handler:b", "handler:c", "cmd:c2", "state:3"]
        );
        assert_eq!(evt_log.batch_sizes(), vec![3]);
    }

    // Boundary (§8): `persist_all([])` is a no-op — no write, no handler calls, no state change.
    #[tokio::test]
    async fn test_persist_all_empty_is_noop() {
        let evt_log = GatedEvtLog::default();
        let entity = spawn_trace_entity(Uuid::from_u128(36), evt_log.clone()).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAllStash(vec![]), TraceAction::Inspect],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "state:0"]);
        assert!(evt_log.batch_sizes().is_empty(), "no write was ever submitted");
    }

    // `persist_all_async`: like `persist_all`, but later commands are processed before the
    // batch's handlers run.
    #[tokio::test]
    async fn test_persist_all_async_does_not_stash_later_commands() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);

        let entity = spawn_trace_entity(Uuid::from_u128(37), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAllAsync(vec!["a".into(), "b".into()])],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        entity
            .handle_command(trace_cmd("c2", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "cmd:c2"]);

        release.send(()).expect("write still awaiting the gate");

        entity
            .handle_command(trace_cmd("c3", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "cmd:c2", "handler:a", "handler:b", "cmd:c3"]
        );
    }

    // A second `persist_async` queued behind an already-submitted one in the same flush must not
    // be stranded: once the first write completes, the leftover envelope is drained immediately
    // even though no new command supplied further events to retrigger the batcher.
    #[tokio::test]
    async fn test_second_async_envelope_in_same_flush_is_not_stranded() {
        let evt_log = GatedEvtLog::default();
        let entity = spawn_trace_entity(Uuid::from_u128(38), evt_log.clone()).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAsync("a".into()), TraceAction::PersistAsync("b".into())],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        // Awaiting a further command proves both writes completed and both handlers ran; if "b"
        // were stranded in journal_batch, this would hang until the test times out.
        entity
            .handle_command(trace_cmd("c2", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "handler:a", "handler:b", "cmd:c2"]
        );
        assert_eq!(evt_log.batch_sizes(), vec![1, 1]);
    }

    // A size-triggered flush that lands while a write is still in flight must queue rather than
    // submit a second, concurrent write: with max_message_batch_size = 2, c1's persist_async(a),
    // persist_async(b) submits [a] eagerly and leaves b queued; while that write is gated open, c2
    // arrives and does persist_async(c), bringing the queue to [b, c] — exactly the
    // max_message_batch_size threshold. The fix must not let this trigger a second in-flight write
    // alongside a's; it must wait for a's write to complete and then flush [b, c] as one batch, so
    // a's handler is matched to a's own record rather than b's.
    #[tokio::test]
    async fn test_size_triggered_flush_waits_for_in_flight_write() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);

        let entity = spawn_trace_entity_with_batch_size(Uuid::from_u128(40), evt_log.clone(), 2).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAsync("a".into()), TraceAction::PersistAsync("b".into())],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        // a's write is held open by the gate; c2 must still be processed right away and must not
        // provoke a second, concurrent write for [b, c].
        entity
            .handle_command(trace_cmd("c2", vec![TraceAction::PersistAsync("c".into())], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "cmd:c2"]);
        assert_eq!(evt_log.batch_sizes(), vec![1], "only a's write may be in flight");

        release.send(()).expect("write still awaiting the gate");

        // c3 cannot run until a's write completes and the queued [b, c] batch is flushed and
        // applied, so awaiting it proves the handlers matched their own records.
        entity
            .handle_command(trace_cmd("c3", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["cmd:c1", "cmd:c2", "handler:a", "handler:b", "handler:c", "cmd:c3"]
        );
        assert_eq!(evt_log.batch_sizes(), vec![1, 2], "[b, c] flushed as a single chunked batch");
    }

    // `defer_async`: with no pending invocation ahead of it, the handler runs synchronously,
    // before `defer_async` (and thus the command handler) returns.
    #[tokio::test]
    async fn test_defer_async_runs_immediately_when_nothing_pending() {
        let evt_log = GatedEvtLog::default();
        let entity = spawn_trace_entity(Uuid::from_u128(39), evt_log.clone()).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd("c1", vec![TraceAction::DeferAsync("d".into())], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "handler:d"]);
        assert!(evt_log.batch_sizes().is_empty(), "a defer with nothing pending never touches the journal");
    }

    // `defer_async`: with a persist already pending, the defer's handler is queued behind it and
    // runs only after the persist's own handler, preserving FIFO ordering.
    #[tokio::test]
    async fn test_defer_async_runs_after_earlier_pending_persists() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);

        let entity = spawn_trace_entity(Uuid::from_u128(40), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd(
                "c1",
                vec![TraceAction::PersistAsync("a".into()), TraceAction::DeferAsync("d".into())],
                &trace,
            ))
            .await
            .expect("sent")
            .expect("accepted");

        // The defer handler cannot have run yet: it was queued behind "a"'s still in-flight write.
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1"]);

        release.send(()).expect("write still awaiting the gate");

        entity
            .handle_command(trace_cmd("c2", vec![], &trace))
            .await
            .expect("sent")
            .expect("accepted");
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "handler:a", "handler:d", "cmd:c2"]);
    }

    // Scenario 4 (§8): rejection. A rejected write never invokes its handler, is never folded into
    // state, and does not stop the entity.
    #[tokio::test]
    async fn test_persist_rejected_is_not_applied_and_entity_continues() {
        let evt_log = GatedEvtLog::default();
        evt_log.push_outcome(vec![JournalEntryOutcome::Rejected(Rejection("invalid payload".into()))]);

        let entity = spawn_trace_entity(Uuid::from_u128(33), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd("c1", vec![TraceAction::PersistStash("bad".into())], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        entity
            .handle_command(trace_cmd("c2", vec![TraceAction::Inspect], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1", "cmd:c2", "state:0"]);
    }

    // Scenario 5 (§8): failure. An infrastructure-level write failure stops the entity outright,
    // without invoking the corresponding persist handler.
    #[tokio::test]
    async fn test_persist_failure_stops_the_entity() {
        let evt_log = GatedEvtLog::default();
        let (release, gate) = oneshot::channel();
        evt_log.push_gate(gate);
        evt_log.push_failure();

        let entity = spawn_trace_entity(Uuid::from_u128(34), evt_log).await;
        let trace = Arc::new(Mutex::new(Vec::new()));

        entity
            .handle_command(trace_cmd("c1", vec![TraceAction::PersistStash("e".into())], &trace))
            .await
            .expect("sent")
            .expect("accepted");

        release.send(()).expect("write still awaiting the gate");

        let result = entity.handle_command(trace_cmd("c2", vec![], &trace)).await;
        assert!(result.is_err(), "entity must stop after a persist failure");
        assert_eq!(*trace.lock().unwrap(), vec!["cmd:c1"]);
    }
}
