use chrono::{DateTime, NaiveDate, NaiveTime};

use crate::model::*;

/// Club-wide booking policy. One per server, shared by every club engine.
///
/// All wall-clock values are minutes after local midnight. Local time is a
/// fixed offset from UTC; the club does not follow DST transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClubConfig {
    pub utc_offset_minutes: i64,
    pub open_minute: i64,
    pub close_minute: i64,
    pub step_minutes: i64,
    pub default_duration_minutes: i64,
    pub lead_time_minutes: i64,
    pub cancel_cutoff_minutes: i64,
    pub whole_day_from_minute: i64,
    pub primary_location: LocationId,
    pub recurrence_weeks: u32,
    pub reminder_lead_minutes: i64,
}

impl Default for ClubConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 60,
            open_minute: 7 * 60,
            close_minute: 24 * 60,
            step_minutes: 30,
            default_duration_minutes: 90,
            lead_time_minutes: 15,
            cancel_cutoff_minutes: 4 * 60,
            whole_day_from_minute: 18 * 60,
            primary_location: "bakaric".into(),
            recurrence_weeks: 4,
            reminder_lead_minutes: 24 * 60,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ClubConfig {
    /// Read overrides from `TABLETIME_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let config = Self {
            utc_offset_minutes: env_or("TABLETIME_UTC_OFFSET_MINUTES", d.utc_offset_minutes),
            open_minute: env_or("TABLETIME_OPEN_MINUTE", d.open_minute),
            close_minute: env_or("TABLETIME_CLOSE_MINUTE", d.close_minute),
            step_minutes: env_or("TABLETIME_STEP_MINUTES", d.step_minutes),
            default_duration_minutes: env_or(
                "TABLETIME_DEFAULT_DURATION_MINUTES",
                d.default_duration_minutes,
            ),
            lead_time_minutes: env_or("TABLETIME_LEAD_TIME_MINUTES", d.lead_time_minutes),
            cancel_cutoff_minutes: env_or(
                "TABLETIME_CANCEL_CUTOFF_MINUTES",
                d.cancel_cutoff_minutes,
            ),
            whole_day_from_minute: env_or(
                "TABLETIME_WHOLE_DAY_FROM_MINUTE",
                d.whole_day_from_minute,
            ),
            primary_location: std::env::var("TABLETIME_PRIMARY_LOCATION")
                .unwrap_or(d.primary_location),
            recurrence_weeks: env_or("TABLETIME_RECURRENCE_WEEKS", d.recurrence_weeks),
            reminder_lead_minutes: env_or(
                "TABLETIME_REMINDER_LEAD_MINUTES",
                d.reminder_lead_minutes,
            ),
        };
        if let Err(msg) = config.validate() {
            tracing::warn!("invalid club config ({msg}), falling back to defaults");
            return Self::default();
        }
        config
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(0..24 * 60).contains(&self.open_minute) {
            return Err("open minute out of range");
        }
        if self.close_minute <= self.open_minute || self.close_minute > 24 * 60 {
            return Err("close minute must be after open and at most 1440");
        }
        if self.step_minutes <= 0 {
            return Err("step must be positive");
        }
        if self.default_duration_minutes <= 0 {
            return Err("default duration must be positive");
        }
        if self.lead_time_minutes < 0 || self.cancel_cutoff_minutes < 0 {
            return Err("lead time and cutoff cannot be negative");
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err("utc offset out of range");
        }
        Ok(())
    }

    pub fn step(&self) -> Ms {
        self.step_minutes * MINUTE
    }

    pub fn default_duration(&self) -> Ms {
        self.default_duration_minutes * MINUTE
    }

    pub fn lead_time(&self) -> Ms {
        self.lead_time_minutes * MINUTE
    }

    pub fn cancel_cutoff(&self) -> Ms {
        self.cancel_cutoff_minutes * MINUTE
    }

    pub fn reminder_lead(&self) -> Ms {
        self.reminder_lead_minutes * MINUTE
    }

    // ── Calendar ─────────────────────────────────────────────────

    /// Local midnight of `date`, as unix ms.
    pub fn day_origin(&self, date: NaiveDate) -> Ms {
        date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
            - self.utc_offset_minutes * MINUTE
    }

    /// Local calendar date containing instant `t`.
    pub fn local_date(&self, t: Ms) -> Option<NaiveDate> {
        t.checked_add(self.utc_offset_minutes * MINUTE)
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive())
    }

    /// Local 23:59:59.999 of the day containing `t`.
    pub fn end_of_day(&self, t: Ms) -> Option<Ms> {
        self.local_date(t).map(|d| self.day_origin(d) + DAY - 1)
    }

    /// Minutes since local midnight.
    pub fn minute_of_day(&self, t: Ms) -> Option<i64> {
        self.local_date(t)
            .map(|d| (t - self.day_origin(d)).div_euclid(MINUTE))
    }

    /// Opening hours of `date`.
    pub fn window(&self, date: NaiveDate) -> Span {
        let origin = self.day_origin(date);
        Span::new(
            origin + self.open_minute * MINUTE,
            origin + self.close_minute * MINUTE,
        )
    }

    pub fn whole_day_from(&self, date: NaiveDate) -> Ms {
        self.day_origin(date) + self.whole_day_from_minute * MINUTE
    }

    /// `YYYY-MM-DD HH:MM` in club time, for messages shown to people.
    pub fn format_local(&self, t: Ms) -> String {
        match t
            .checked_add(self.utc_offset_minutes * MINUTE)
            .and_then(DateTime::from_timestamp_millis)
        {
            Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
            None => t.to_string(),
        }
    }
}
