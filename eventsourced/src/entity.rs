//! The entity's run loop: the four-state machine (§4.1 recovery-started / replay-started /
//! processing-commands / persisting-events) driving all message dispatch for one spawned entity.

use crate::{
    effect::{BatchEnvelope, EntityCore, Effect},
    error::{HandleCommandError, SpawnError},
    evt_log::{EvtLog, JournalEntry, JournalEntryOutcome, PersistentRepr},
    pending::PendingKind,
    recovery::{Recovery, SnapshotSelection},
    snapshot_store::{Snapshot, SnapshotStore},
    EventSourced, SeqNo,
};
use futures::{future::BoxFuture, pin_mut, StreamExt};
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

static INSTANCE_ID: AtomicU32 = AtomicU32::new(0);

fn next_instance_id() -> u32 {
    INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Extension methods for types implementing [EventSourced].
pub trait EventSourcedExt: Sized {
    /// Spawns an event sourced entity and returns an [EntityRef] as a handle for it.
    ///
    /// First `snapshot_store` is consulted per `recovery.from_snapshot`, then `evt_log` is
    /// replayed from the snapshot's sequence number (or from the beginning) up to
    /// `recovery.to_sequence_nr`, replaying at most `recovery.replay_max` events. Only once that
    /// completes is the first command accepted.
    #[allow(async_fn_in_trait)]
    #[allow(clippy::too_many_arguments)]
    async fn spawn<L, S>(
        id: Self::Id,
        recovery: Recovery,
        max_message_batch_size: usize,
        cmd_buffer: usize,
        evt_log: L,
        snapshot_store: S,
    ) -> Result<EntityRef<Self>, SpawnError<S::Error, L::Error>>
    where
        Self: EventSourced,
        L: EvtLog<Id = Self::Id, Evt = Self::Evt>,
        S: SnapshotStore<Id = Self::Id, State = Self::State>,
    {
        spawn_impl::<Self, L, S>(
            id,
            recovery,
            max_message_batch_size,
            cmd_buffer,
            evt_log,
            snapshot_store,
        )
        .await
    }
}

impl<E> EventSourcedExt for E where E: EventSourced {}

#[instrument(skip(evt_log, snapshot_store))]
async fn spawn_impl<E, L, S>(
    id: E::Id,
    recovery: Recovery,
    max_message_batch_size: usize,
    cmd_buffer: usize,
    evt_log: L,
    snapshot_store: S,
) -> Result<EntityRef<E>, SpawnError<S::Error, L::Error>>
where
    E: EventSourced,
    L: EvtLog<Id = E::Id, Evt = E::Evt>,
    S: SnapshotStore<Id = E::Id, State = E::State>,
{
    assert!(max_message_batch_size >= 1, "max_message_batch_size must be positive");
    assert!(cmd_buffer >= 1, "cmd_buffer must be positive");

    let instance_id = next_instance_id();
    let writer_uuid = format!("{}-{}-{}", E::TYPE_NAME, instance_id, Uuid::new_v4());

    // S0: recovery-started. Restore a snapshot, if selected.
    let mut state = E::State::default();
    let mut last_sequence_nr = None;
    if matches!(recovery.from_snapshot, SnapshotSelection::Latest) {
        let snapshot = snapshot_store.load(&id).await.map_err(|cause| {
            E::on_replay_failure(&id, &cause);
            SpawnError::LoadSnapshot(cause)
        })?;
        if let Some(Snapshot { seq_no, state: s }) = snapshot {
            debug!(?id, %seq_no, "restored snapshot");
            state = s;
            last_sequence_nr = Some(seq_no);
        }
    }

    // S1: replay-started.
    let from = SeqNo::succ_of(last_sequence_nr);
    let stream = evt_log
        .replay(&id, from, recovery.to_sequence_nr, recovery.replay_max)
        .await
        .map_err(|cause| {
            E::on_replay_failure(&id, &cause);
            SpawnError::Replay(cause)
        })?;
    pin_mut!(stream);
    let mut replayed = 0u64;
    while let Some(item) = stream.next().await {
        match item {
            Ok((seq_no, evt)) => {
                last_sequence_nr = Some(seq_no);
                E::apply_event(&mut state, &evt);
                replayed += 1;
            }
            Err(cause) => {
                E::on_replay_failure(&id, &cause);
                return Err(SpawnError::Replay(cause));
            }
        }
    }
    let highest = evt_log.last_seq_no(&id).await.map_err(|cause| {
        E::on_replay_failure(&id, &cause);
        SpawnError::LastSeqNo(cause)
    })?;
    let highest = match (highest, last_sequence_nr) {
        (Some(h), Some(l)) => Some(h.max(l)),
        (h, l) => h.or(l),
    };
    let sequence_nr = highest;
    last_sequence_nr = highest;
    debug!(?id, replayed, ?sequence_nr, "recovery completed");
    E::on_recovery_completed(&id, &state);

    // S2/S3: command processing.
    let (cmd_in, cmd_out) = mpsc::channel(cmd_buffer);
    let delete = {
        let evt_log = evt_log.clone();
        let id = id.clone();
        Arc::new(move |to_seq_no: SeqNo| {
            let evt_log = evt_log.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(cause) = evt_log.delete_to(&id, to_seq_no).await {
                    E::on_delete_messages_failure(&id, &cause, to_seq_no);
                }
            });
        })
    };

    let core = EntityCore {
        id: id.clone(),
        writer_uuid,
        state,
        last_sequence_nr,
        sequence_nr,
        pending_invocations: VecDeque::new(),
        pending_stashing_count: 0,
        event_batch: Vec::new(),
        max_message_batch_size,
        delete,
    };

    tokio::spawn(run::<E, L>(core, evt_log, cmd_out));

    Ok(EntityRef { cmd_in })
}

/// A future write result together with the entries it was submitted with, so outcomes (in
/// submission order) can be matched back up to the pending invocations they resolve.
struct InFlight<E: EventSourced, L: EvtLog> {
    entries: Vec<JournalEntry<E::Id, E::Evt>>,
    fut: BoxFuture<'static, Result<Vec<JournalEntryOutcome>, L::Error>>,
}

async fn poll_in_flight<E, L>(
    in_flight: &mut Option<InFlight<E, L>>,
) -> (Vec<JournalEntry<E::Id, E::Evt>>, Result<Vec<JournalEntryOutcome>, L::Error>)
where
    E: EventSourced,
    L: EvtLog<Id = E::Id, Evt = E::Evt>,
{
    match in_flight {
        Some(f) => {
            let result = (&mut f.fut).await;
            let entries = in_flight.take().expect("in_flight present").entries;
            (entries, result)
        }
        None => std::future::pending().await,
    }
}

type Mailbox<E> = mpsc::Receiver<(
    <E as EventSourced>::Cmd,
    oneshot::Sender<Result<(), <E as EventSourced>::Error>>,
)>;

type Stashed<E> = (
    <E as EventSourced>::Cmd,
    oneshot::Sender<Result<(), <E as EventSourced>::Error>>,
);

async fn next_command<E: EventSourced>(
    stash: &mut VecDeque<Stashed<E>>,
    mailbox: &mut Mailbox<E>,
) -> Option<Stashed<E>> {
    if let Some(stashed) = stash.pop_front() {
        return Some(stashed);
    }
    mailbox.recv().await
}

/// Takes at most `max` entries off the front of `journal_batch`, leaving any remainder queued for
/// a later flush. Keeps every submission within `max_message_batch_size` regardless of how many
/// entries accumulated while a previous write was in flight.
fn take_chunk<Id, Evt>(
    journal_batch: &mut Vec<JournalEntry<Id, Evt>>,
    max: usize,
) -> Vec<JournalEntry<Id, Evt>> {
    if journal_batch.len() <= max {
        std::mem::take(journal_batch)
    } else {
        journal_batch.drain(..max).collect()
    }
}

/// Runs the flush procedure (§4.3): empties `core.event_batch` into `journal_batch`, stamping
/// identity and assigning sequence numbers, submitting at most one new write.
fn flush_batch<E, L>(
    core: &mut EntityCore<E>,
    evt_log: &L,
    journal_batch: &mut Vec<JournalEntry<E::Id, E::Evt>>,
    write_in_progress: &mut bool,
) -> Option<InFlight<E, L>>
where
    E: EventSourced,
    L: EvtLog<Id = E::Id, Evt = E::Evt>,
{
    let mut to_submit = None;

    // Step 1: a stashing persist must not be coalesced into the same journal round trip as
    // envelopes that were already queued from prior async persists in this or an earlier command.
    if core.pending_stashing_count > 0 && !journal_batch.is_empty() && !*write_in_progress {
        to_submit = Some(take_chunk(journal_batch, core.max_message_batch_size));
    }

    // Step 2: walk event_batch in submission order, finalizing each envelope. Collected into an
    // owned Vec first so the loop body is free to take further `&mut core` borrows (e.g. to
    // assign sequence numbers) without conflicting with a live borrow of `core.event_batch`.
    let envelopes: Vec<BatchEnvelope<E>> = core.event_batch.drain(..).collect();
    for envelope in envelopes {
        let entry = match envelope {
            BatchEnvelope::Write(evts) => {
                let records = evts
                    .into_iter()
                    .map(|payload| PersistentRepr {
                        persistence_id: core.id.clone(),
                        seq_no: core.next_sequence_nr(),
                        writer_uuid: core.writer_uuid.clone(),
                        payload,
                    })
                    .collect();
                JournalEntry::Write(records)
            }
            BatchEnvelope::Loop(payload) => JournalEntry::Loop(payload),
        };
        journal_batch.push(entry);

        // Only one write may ever be in flight (`InFlight` holds a single future), so a
        // submission may only be claimed here while no write is currently outstanding. Reaching
        // `max_message_batch_size` while a write *is* in flight must not trigger a second,
        // concurrent submission — that would silently drop the in-flight future and desync
        // `pending_invocations` from what the journal actually has outstanding. Such envelopes
        // simply keep accumulating in `journal_batch` until the in-flight write completes.
        if !*write_in_progress && to_submit.is_none() {
            to_submit = Some(take_chunk(journal_batch, core.max_message_batch_size));
        }
    }

    // Drains any remaining queued envelopes left behind by a prior call (e.g. a second
    // `persist_async` in the same command, pushed into `journal_batch` after an earlier one in
    // the same flush already claimed `to_submit`, or a whole burst that queued up while an
    // earlier write was in flight). Mirrors §4.2's `WriteMessagesSuccessful` handling ("if
    // journalBatch is empty, clear writeInProgress; else flush it"): as soon as no write is in
    // flight, anything still queued must go out, even if this particular flush call was
    // triggered by a write completing rather than by new envelopes arriving. Chunked at
    // `max_message_batch_size` per §4.3 step 2 rather than submitted as a single oversized write;
    // any remainder stays in `journal_batch` for the next flush once this one completes.
    if to_submit.is_none() && !*write_in_progress && !journal_batch.is_empty() {
        to_submit = Some(take_chunk(journal_batch, core.max_message_batch_size));
    }

    to_submit.map(|entries| {
        *write_in_progress = true;
        debug!(id = ?core.id, entries = entries.len(), "persisting entries");
        let fut = {
            let evt_log = evt_log.clone();
            let id = core.id.clone();
            let submitted = entries.clone();
            Box::pin(async move { evt_log.write_batch(&id, submitted).await })
        };
        InFlight { entries, fut }
    })
}

/// Invokes a persist handler (or the command handler, via the caller), catching panics the way
/// the distilled spec's "handler exception" case requires: the run loop treats a caught panic
/// identically to a persist failure (drain and stop), since this crate has no supervisor able to
/// restart the entity in place (§4.5, §7).
fn invoke_guarded<F>(f: F) -> Result<(), ()>
where
    F: FnOnce(),
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| ())
}

async fn run<E, L>(mut core: EntityCore<E>, evt_log: L, mut mailbox: Mailbox<E>)
where
    E: EventSourced,
    L: EvtLog<Id = E::Id, Evt = E::Evt>,
{
    let id = core.id.clone();
    let mut internal_stash: VecDeque<Stashed<E>> = VecDeque::new();
    let mut journal_batch: Vec<JournalEntry<E::Id, E::Evt>> = Vec::new();
    let mut write_in_progress = false;
    let mut in_flight: Option<InFlight<E, L>> = None;

    'outer: loop {
        if core.pending_stashing_count == 0 {
            // S2: processing-commands.
            tokio::select! {
                biased;

                (entries, outcomes) = poll_in_flight(&mut in_flight) => {
                    write_in_progress = false;
                    if !handle_write_reply::<E, L>(&mut core, entries, outcomes) {
                        break 'outer;
                    }
                    if let Some(next) = flush_batch(&mut core, &evt_log, &mut journal_batch, &mut write_in_progress) {
                        debug_assert!(in_flight.is_none(), "flush_batch must not submit while a write is already in flight");
                        in_flight = Some(next);
                    }
                }

                maybe_cmd = next_command::<E>(&mut internal_stash, &mut mailbox) => {
                    let Some((cmd, reply)) = maybe_cmd else {
                        debug!(?id, "mailbox closed, stopping entity");
                        break 'outer;
                    };

                    let mut panicked = false;
                    let mut result = None;
                    {
                        let core = &mut core;
                        let outcome = invoke_guarded(|| {
                            let mut effect = Effect::new(core);
                            result = Some(E::handle_command(&id, &mut effect, cmd));
                        });
                        if outcome.is_err() {
                            panicked = true;
                        }
                    }

                    if panicked {
                        error!(?id, "command handler panicked, stopping entity");
                        // Dropping `reply` without sending surfaces as `EntityTerminated` to the
                        // caller, the same outcome as every other stop-the-entity failure.
                        drop(reply);
                        internal_stash.clear();
                        break 'outer;
                    }

                    let result = result.expect("handler ran without panicking");
                    let _ = reply.send(result);

                    if let Some(next) = flush_batch(&mut core, &evt_log, &mut journal_batch, &mut write_in_progress) {
                        debug_assert!(in_flight.is_none(), "flush_batch must not submit while a write is already in flight");
                        in_flight = Some(next);
                    }
                }
            }
        } else {
            // S3: persisting-events.
            tokio::select! {
                biased;

                (entries, outcomes) = poll_in_flight(&mut in_flight) => {
                    write_in_progress = false;
                    if !handle_write_reply::<E, L>(&mut core, entries, outcomes) {
                        break 'outer;
                    }
                    if let Some(next) = flush_batch(&mut core, &evt_log, &mut journal_batch, &mut write_in_progress) {
                        debug_assert!(in_flight.is_none(), "flush_batch must not submit while a write is already in flight");
                        in_flight = Some(next);
                    }
                }

                maybe_cmd = mailbox.recv() => {
                    match maybe_cmd {
                        Some(stashed) => internal_stash.push_back(stashed),
                        None => {
                            debug!(?id, "mailbox closed while persisting, stopping entity");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    debug!(?id, "entity stopped");
}

/// Processes the outcomes of one completed write, in submission order. Returns `false` if the
/// entity must stop (a persist failure or a handler panic).
fn handle_write_reply<E, L>(
    core: &mut EntityCore<E>,
    entries: Vec<JournalEntry<E::Id, E::Evt>>,
    outcomes: Result<Vec<JournalEntryOutcome>, L::Error>,
) -> bool
where
    E: EventSourced,
    L: EvtLog<Id = E::Id, Evt = E::Evt>,
{
    let outcomes = match outcomes {
        Ok(outcomes) => outcomes,
        Err(cause) => {
            for entry in &entries {
                for (seq_no, payload) in entry_records(entry) {
                    E::on_persist_failure(&core.id, &cause, payload, seq_no);
                }
                // Pop the corresponding pending invocations without invoking them: durability is
                // unknown, so no handler may observe a possibly-unpersisted event as persisted.
                for _ in entry_records(entry) {
                    core.pending_invocations.pop_front();
                }
            }
            return false;
        }
    };

    for (entry, outcome) in entries.into_iter().zip(outcomes) {
        match (entry, outcome) {
            (JournalEntry::Write(records), JournalEntryOutcome::Accepted) => {
                for record in records {
                    core.update_last_sequence_nr(record.seq_no);
                    E::apply_event(&mut core.state, &record.payload);
                    let invocation = core
                        .pending_invocations
                        .pop_front()
                        .expect("pending invocation for written record");
                    let kind = invocation.kind;
                    let panicked = invoke_guarded(|| {
                        let mut effect = Effect::new(core);
                        invocation.invoke(&mut effect, &record.payload);
                    })
                    .is_err();
                    if kind == PendingKind::Stashing {
                        core.pending_stashing_count -= 1;
                    }
                    if panicked {
                        error!(id = ?core.id, "persist handler panicked, stopping entity");
                        return false;
                    }
                }
            }
            (JournalEntry::Write(records), JournalEntryOutcome::Rejected(cause)) => {
                for record in records {
                    core.update_last_sequence_nr(record.seq_no);
                    let invocation = core
                        .pending_invocations
                        .pop_front()
                        .expect("pending invocation for rejected record");
                    E::on_persist_rejected(&core.id, &cause, &record.payload, record.seq_no);
                    if invocation.kind == PendingKind::Stashing {
                        core.pending_stashing_count -= 1;
                    }
                }
            }
            (JournalEntry::Loop(payload), JournalEntryOutcome::Accepted) => {
                let invocation = core
                    .pending_invocations
                    .pop_front()
                    .expect("pending invocation for loop entry");
                let kind = invocation.kind;
                let panicked = invoke_guarded(|| {
                    let mut effect = Effect::new(core);
                    invocation.invoke(&mut effect, &payload);
                })
                .is_err();
                if kind == PendingKind::Stashing {
                    core.pending_stashing_count -= 1;
                }
                if panicked {
                    error!(id = ?core.id, "deferred handler panicked, stopping entity");
                    return false;
                }
            }
            (JournalEntry::Loop(_), JournalEntryOutcome::Rejected(cause)) => {
                warn!(id = ?core.id, %cause, "journal rejected a non-persistent loop entry, ignoring");
                core.pending_invocations.pop_front();
            }
        }
    }

    true
}

fn entry_records<Id, Evt>(entry: &JournalEntry<Id, Evt>) -> Vec<(SeqNo, &Evt)> {
    match entry {
        JournalEntry::Write(records) => {
            records.iter().map(|r| (r.seq_no, &r.payload)).collect()
        }
        JournalEntry::Loop(_) => Vec::new(),
    }
}

/// A handle for a spawned event sourced entity, used to invoke its command handler.
#[derive(Debug, Clone)]
pub struct EntityRef<E>
where
    E: EventSourced,
{
    cmd_in: mpsc::Sender<(E::Cmd, oneshot::Sender<Result<(), E::Error>>)>,
}

impl<E> EntityRef<E>
where
    E: EventSourced,
{
    /// Sends a command to the entity and awaits the result of its command handler.
    #[instrument(skip(self, cmd))]
    pub async fn handle_command(&self, cmd: E::Cmd) -> Result<Result<(), E::Error>, HandleCommandError> {
        let (reply_in, reply_out) = oneshot::channel();
        self.cmd_in
            .send((cmd, reply_in))
            .await
            .map_err(|_| HandleCommandError::Send)?;
        reply_out.await.map_err(|_| HandleCommandError::EntityTerminated)
    }
}
