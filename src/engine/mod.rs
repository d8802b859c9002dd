mod availability;
mod conflict;
mod error;
mod mutations;
pub mod policy;
mod queries;

pub use availability::{generate_slots, Slot, SlotKind, SlotQuery};
pub use conflict::{contends, find_conflict, ResourceKeys};
pub use error::EngineError;
pub use queries::SlotRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::ClubConfig;
use crate::model::*;
use crate::wal::Wal;

/// Source of "now". Swapped out in tests to pin lead time and cutoff checks.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events that must land in the log together (one create, or a recurring series).
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let events: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(events as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One club's schedule plus its write-ahead log.
pub struct Engine {
    pub(super) schedule: RwLock<Schedule>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub config: Arc<ClubConfig>,
    clock: Clock,
}

/// Apply an event to the schedule (no locking, caller holds the lock).
fn apply(schedule: &mut Schedule, event: &Event) {
    match event {
        Event::ActivityCreated { activity } => schedule.insert(activity.clone()),
        Event::StatusChanged { id, status } => {
            if let Some(a) = schedule.get_mut(*id) {
                a.status = *status;
            }
        }
        Event::ActivityDeleted { id } => {
            schedule.remove(*id);
        }
        Event::ReminderMarked { id } => {
            if let Some(a) = schedule.get_mut(*id) {
                a.reminder_sent = true;
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: Arc<ClubConfig>) -> io::Result<Self> {
        Self::with_clock(wal_path, config, Arc::new(conflict::now_ms))
    }

    pub fn with_clock(wal_path: PathBuf, config: Arc<ClubConfig>, clock: Clock) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            Wal::truncate_to(&wal_path, replay.valid_len)?;
        }
        let events = replay.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut schedule = Schedule::new();
        for event in &events {
            apply(&mut schedule, event);
        }
        tracing::debug!(
            "replayed {} events into {} activities from {}",
            events.len(),
            schedule.len(),
            wal_path.display()
        );

        Ok(Self {
            schedule: RwLock::new(schedule),
            wal_tx,
            config,
            clock,
        })
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, all under the caller's write guard.
    pub(super) async fn persist_and_apply(
        &self,
        schedule: &mut Schedule,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.wal_append(events.clone()).await {
            tracing::error!("WAL append failed: {e}");
            return Err(e);
        }
        for event in &events {
            apply(schedule, event);
        }
        Ok(())
    }
}
