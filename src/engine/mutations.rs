use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ACTIVITIES_CREATED_TOTAL, REJECTIONS_TOTAL};

use super::conflict::{check_no_conflict, validate_span, ResourceKeys};
use super::policy;
use super::{Engine, EngineError, WalCommand};

fn check_text(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_id(value: Option<&str>, what: &'static str) -> Result<(), EngineError> {
    if value.is_some_and(|v| v.trim().is_empty()) {
        return Err(EngineError::Validation(format!("{what} cannot be empty")));
    }
    check_text(value, MAX_ID_LEN, what)
}

fn check_count(value: Option<u32>, max: u32, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(0) => Err(EngineError::Validation(format!("{what} must be positive"))),
        Some(n) if n > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn record_rejection(err: &EngineError) {
    metrics::counter!(REJECTIONS_TOTAL, "kind" => err.kind()).increment(1);
    if let EngineError::Conflict { reason, .. } = err {
        tracing::warn!("booking rejected: {reason}");
    }
}

impl Engine {
    /// Create a booking for the caller (or, for staff, on behalf of someone else).
    pub async fn create_booking(
        &self,
        auth: &AuthContext,
        req: BookingRequest,
    ) -> Result<Activity, EngineError> {
        let result = self.try_create_booking(auth, req).await;
        if let Err(e) = &result {
            record_rejection(e);
        }
        result
    }

    async fn try_create_booking(
        &self,
        auth: &AuthContext,
        req: BookingRequest,
    ) -> Result<Activity, EngineError> {
        check_id(Some(&auth.user_id), "user id")?;
        check_id(req.coach_id.as_deref(), "coach id")?;
        check_id(req.location_id.as_deref(), "location id")?;
        check_id(req.target_user_id.as_deref(), "target user id")?;
        check_text(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        check_count(req.participant_count, MAX_PARTICIPANTS, "participant count")?;
        check_count(req.table_count, MAX_TABLES, "table count")?;

        let config = &self.config;
        let span = policy::booking_span(config, &req)?;
        validate_span(&span)?;
        let category = if req.whole_day { Category::WholeDay } else { Category::Normal };

        let now = self.now();
        policy::check_lead_time(auth, span.start, now, config)?;
        if req.whole_day {
            policy::check_whole_day_start(auth, span.start, config)?;
        }

        let owner_id = policy::resolve_owner(auth, req.target_user_id.as_deref());
        let location_id = req
            .location_id
            .unwrap_or_else(|| config.primary_location.clone());

        let mut guard = self.schedule.write().await;
        if guard.len() >= MAX_ACTIVITIES_PER_CLUB {
            return Err(EngineError::LimitExceeded("too many activities in club"));
        }
        let keys = ResourceKeys {
            coach_id: req.coach_id.as_deref(),
            location_id: &location_id,
        };
        check_no_conflict(&guard, &span, &keys, category, config)?;

        let activity = Activity {
            id: Ulid::new(),
            owner_id,
            coach_id: req.coach_id,
            location_id,
            span,
            status: policy::initial_status(auth, category),
            category,
            notes: req.notes,
            participant_count: req.participant_count,
            table_count: req.table_count,
            reminder_sent: false,
        };
        let event = Event::ActivityCreated { activity: activity.clone() };
        self.persist_and_apply(&mut guard, vec![event]).await?;

        metrics::counter!(ACTIVITIES_CREATED_TOTAL, "category" => category.as_str()).increment(1);
        tracing::info!(
            "booking {} by {} for {} at {} ({})",
            activity.id,
            auth.user_id,
            activity.owner_id,
            config.format_local(activity.span.start),
            activity.status.as_str()
        );
        Ok(activity)
    }

    /// Create a hall block, optionally repeated weekly. Either every occurrence
    /// is stored or none is.
    pub async fn create_block(
        &self,
        auth: &AuthContext,
        req: BlockRequest,
    ) -> Result<Vec<Activity>, EngineError> {
        let result = self.try_create_block(auth, req).await;
        if let Err(e) = &result {
            record_rejection(e);
        }
        result
    }

    async fn try_create_block(
        &self,
        auth: &AuthContext,
        req: BlockRequest,
    ) -> Result<Vec<Activity>, EngineError> {
        if !auth.is_privileged() {
            return Err(EngineError::Unauthorized("only staff can block the hall".into()));
        }
        check_id(Some(&auth.user_id), "user id")?;
        check_id(req.coach_id.as_deref(), "coach id")?;
        check_id(req.location_id.as_deref(), "location id")?;
        check_text(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;

        let config = &self.config;
        let base = policy::block_span(config, &req)?;
        validate_span(&base)?;
        let weeks = if req.recurring { config.recurrence_weeks } else { 0 };
        if weeks > MAX_RECURRENCE_WEEKS {
            return Err(EngineError::LimitExceeded("too many recurrences"));
        }
        let spans = policy::expand_weekly(base, weeks);
        for span in &spans {
            validate_span(span)?;
        }

        let location_id = req
            .location_id
            .unwrap_or_else(|| config.primary_location.clone());

        let mut guard = self.schedule.write().await;
        if guard.len() + spans.len() > MAX_ACTIVITIES_PER_CLUB {
            return Err(EngineError::LimitExceeded("too many activities in club"));
        }
        let keys = ResourceKeys {
            coach_id: req.coach_id.as_deref(),
            location_id: &location_id,
        };
        // Occurrences are a week apart and never overlap each other.
        for span in &spans {
            check_no_conflict(&guard, span, &keys, Category::Block, config)?;
        }

        let activities: Vec<Activity> = spans
            .into_iter()
            .map(|span| Activity {
                id: Ulid::new(),
                owner_id: auth.user_id.clone(),
                coach_id: req.coach_id.clone(),
                location_id: location_id.clone(),
                span,
                status: policy::initial_status(auth, Category::Block),
                category: Category::Block,
                notes: req.notes.clone(),
                participant_count: None,
                table_count: None,
                reminder_sent: false,
            })
            .collect();
        let events = activities
            .iter()
            .map(|a| Event::ActivityCreated { activity: a.clone() })
            .collect();
        self.persist_and_apply(&mut guard, events).await?;

        metrics::counter!(ACTIVITIES_CREATED_TOTAL, "category" => Category::Block.as_str())
            .increment(activities.len() as u64);
        tracing::info!(
            "hall {} blocked by {} from {} ({} occurrence(s))",
            location_id,
            auth.user_id,
            config.format_local(base.start),
            activities.len()
        );
        Ok(activities)
    }

    /// Hard-delete an activity. Owners must respect the cancellation cutoff.
    pub async fn delete_activity(&self, auth: &AuthContext, id: Ulid) -> Result<Activity, EngineError> {
        let mut guard = self.schedule.write().await;
        let activity = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if let Err(e) = policy::check_delete(auth, &activity, self.now(), &self.config) {
            record_rejection(&e);
            return Err(e);
        }
        self.persist_and_apply(&mut guard, vec![Event::ActivityDeleted { id }])
            .await?;
        tracing::info!("activity {id} deleted by {}", auth.user_id);
        Ok(activity)
    }

    /// Confirm, cancel or complete an activity. Returns the updated record.
    pub async fn change_status(
        &self,
        auth: &AuthContext,
        id: Ulid,
        status: Status,
    ) -> Result<Activity, EngineError> {
        let mut guard = self.schedule.write().await;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if let Err(e) = policy::check_transition(auth, current, status) {
            record_rejection(&e);
            return Err(e);
        }
        let from = current.status;
        self.persist_and_apply(&mut guard, vec![Event::StatusChanged { id, status }])
            .await?;
        tracing::info!(
            "activity {id} {} -> {} by {}",
            from.as_str(),
            status.as_str(),
            auth.user_id
        );
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Flip `reminder_sent` once. Only the reminder sweep calls this.
    pub async fn mark_reminder_sent(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.schedule.write().await;
        let activity = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if activity.reminder_sent {
            return Err(EngineError::ReminderAlreadySent(id));
        }
        self.persist_and_apply(&mut guard, vec![Event::ReminderMarked { id }])
            .await
    }

    /// Compact the WAL by rewriting it with one create event per live activity.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Held across the swap so no append lands between snapshot and rewrite.
        let guard = self.schedule.write().await;
        let events = guard
            .activities
            .iter()
            .map(|a| Event::ActivityCreated { activity: a.clone() })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guard);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
