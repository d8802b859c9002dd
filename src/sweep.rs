use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Activity;
use crate::observability::REMINDERS_SENT_TOTAL;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Where upcoming-session reminders go. Delivery (email, push) lives outside
/// this crate; the sweep only decides who is due and records that they were told.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn send_reminder(&self, club: &str, activity: &Activity) -> Result<(), SinkError>;
}

/// Default sink: writes the reminder to the log.
#[derive(Debug, Default)]
pub struct LogReminderSink;

#[async_trait]
impl ReminderSink for LogReminderSink {
    async fn send_reminder(&self, club: &str, activity: &Activity) -> Result<(), SinkError> {
        info!(
            "reminder: {club} activity {} for {} starts at {}",
            activity.id, activity.owner_id, activity.span.start
        );
        Ok(())
    }
}

/// One pass: hand every due activity to the sink, then flag it. Returns how
/// many were flagged.
pub async fn sweep_reminders(club: &str, engine: &Engine, sink: &dyn ReminderSink) -> usize {
    let due = engine.due_reminders(engine.now()).await;
    let mut sent = 0;
    for activity in due {
        if let Err(e) = sink.send_reminder(club, &activity).await {
            warn!("reminder for {} not delivered, retrying next sweep: {e}", activity.id);
            continue;
        }
        match engine.mark_reminder_sent(activity.id).await {
            Ok(()) => {
                sent += 1;
                metrics::counter!(REMINDERS_SENT_TOTAL).increment(1);
            }
            // Deleted or flagged since the snapshot was taken.
            Err(e) => debug!("reminder skip {}: {e}", activity.id),
        }
    }
    sent
}

/// Background task that sends reminders for one club once a minute.
pub async fn run_reminder_sweep(club: String, engine: Arc<Engine>, sink: Arc<dyn ReminderSink>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let sent = sweep_reminders(&club, &engine, sink.as_ref()).await;
        if sent > 0 {
            debug!("{club}: {sent} reminder(s) sent");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(club: String, engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("{club}: compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("{club}: WAL compaction failed: {e}"),
        }
    }
}
