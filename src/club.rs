use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::ClubConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::sweep::{self, LogReminderSink, ReminderSink};

/// Manages per-club engines. Each club gets its own Engine + WAL + reminder
/// sweep + compactor. Club = database name from the pgwire connection.
pub struct ClubManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: Arc<ClubConfig>,
    reminders: Arc<dyn ReminderSink>,
}

impl ClubManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, config: ClubConfig) -> Self {
        Self::with_reminder_sink(data_dir, compact_threshold, config, Arc::new(LogReminderSink))
    }

    pub fn with_reminder_sink(
        data_dir: PathBuf,
        compact_threshold: u64,
        config: ClubConfig,
        reminders: Arc<dyn ReminderSink>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config: Arc::new(config),
            reminders,
        }
    }

    /// Get or lazily create the engine for a club. Names that sanitize to the
    /// same file name share one engine.
    pub fn get_or_create(&self, club: &str) -> std::io::Result<Arc<Engine>> {
        if club.len() > MAX_CLUB_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "club name too long",
            ));
        }

        // Sanitize club name to prevent path traversal
        let safe_name: String = club
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty club name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        if self.engines.len() >= MAX_CLUBS {
            return Err(std::io::Error::other("too many clubs"));
        }

        // Two connections to a new club may race here; the entry lock makes one win.
        // No other map access until the entry is released: len() would deadlock.
        let entry = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.config.clone())?);

        tokio::spawn(sweep::run_reminder_sweep(
            safe_name.clone(),
            engine.clone(),
            self.reminders.clone(),
        ));
        tokio::spawn(sweep::run_compactor(
            safe_name.clone(),
            engine.clone(),
            self.compact_threshold,
        ));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::CLUBS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("club {safe_name} loaded");
        Ok(engine)
    }
}
