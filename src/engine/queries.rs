use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{generate_slots, Slot, SlotQuery};
use super::conflict::{contends, ResourceKeys};
use super::{Engine, EngineError};

/// Availability request for one day.
///
/// With a coach, the slots reflect that coach's sessions plus hall-wide claims
/// at the location. Without one ("hall mode"), every activity at the location
/// occupies its slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub day: NaiveDate,
    pub coach_id: Option<CoachId>,
    pub location_id: Option<LocationId>,
    pub duration: Option<Ms>,
    pub step: Option<Ms>,
}

impl SlotRequest {
    pub fn for_day(day: NaiveDate) -> Self {
        Self {
            day,
            coach_id: None,
            location_id: None,
            duration: None,
            step: None,
        }
    }
}

impl Engine {
    pub async fn available_slots(
        &self,
        auth: &AuthContext,
        req: SlotRequest,
    ) -> Result<Vec<Slot>, EngineError> {
        let config = &self.config;
        let step = req.step.unwrap_or_else(|| config.step());
        if step <= 0 {
            return Err(EngineError::Validation("step must be positive".into()));
        }
        if req.duration.is_some_and(|d| d <= 0) {
            return Err(EngineError::Validation("duration must be positive".into()));
        }
        let window = config.window(req.day);
        if (window.duration_ms() / step) as usize > MAX_SLOTS_PER_QUERY {
            return Err(EngineError::LimitExceeded("too many slots for step"));
        }
        let location_id = req
            .location_id
            .unwrap_or_else(|| config.primary_location.clone());

        let guard = self.schedule.read().await;
        let hall: Vec<&Activity> = guard
            .overlapping(&window)
            .filter(|a| a.occupies() && a.location_id == location_id)
            .collect();
        let scope: Vec<&Activity> = match req.coach_id.as_deref() {
            Some(coach) => {
                let keys = ResourceKeys {
                    coach_id: Some(coach),
                    location_id: &location_id,
                };
                guard
                    .overlapping(&window)
                    .filter(|a| contends(a, &keys, Category::Normal))
                    .collect()
            }
            None => hall.clone(),
        };

        let query = SlotQuery {
            window,
            step,
            whole_day_from: config.whole_day_from(req.day),
            duration: req.duration,
            earliest: (!auth.is_privileged()).then(|| self.now() + config.lead_time()),
        };
        Ok(generate_slots(&query, &scope, &hall))
    }

    /// Everything touching the local calendar day, cancelled activities included.
    pub async fn activities_on(
        &self,
        day: NaiveDate,
        location_id: Option<&str>,
        coach_id: Option<&str>,
    ) -> Vec<Activity> {
        let origin = self.config.day_origin(day);
        let span = Span::new(origin, origin + DAY);
        let guard = self.schedule.read().await;
        guard
            .overlapping(&span)
            .filter(|a| location_id.is_none_or(|l| a.location_id == l))
            .filter(|a| coach_id.is_none_or(|c| a.coach_id.as_deref() == Some(c)))
            .cloned()
            .collect()
    }

    pub async fn get_activity(&self, id: Ulid) -> Result<Activity, EngineError> {
        let guard = self.schedule.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Confirmed activities starting within the reminder lead that have not
    /// been reminded yet.
    pub async fn due_reminders(&self, now: Ms) -> Vec<Activity> {
        let horizon = now + self.config.reminder_lead();
        let guard = self.schedule.read().await;
        let from = guard.activities.partition_point(|a| a.span.start <= now);
        guard.activities[from..]
            .iter()
            .take_while(|a| a.span.start <= horizon)
            .filter(|a| a.status == Status::Confirmed && !a.reminder_sent)
            .cloned()
            .collect()
    }

    pub async fn activity_count(&self) -> usize {
        self.schedule.read().await.len()
    }
}
