//! Temporal and ownership rules applied around the conflict check.
//!
//! Everything here is pure: callers pass `now` and the club configuration, so
//! the rules can be exercised without an engine.

use crate::config::ClubConfig;
use crate::model::*;

use super::EngineError;

/// Privileged callers may book for someone else; everyone else books for themselves.
pub fn resolve_owner(auth: &AuthContext, target_user_id: Option<&str>) -> UserId {
    match target_user_id {
        Some(target) if auth.is_privileged() && !target.is_empty() => target.to_string(),
        _ => auth.user_id.clone(),
    }
}

/// Interval a booking request will occupy.
///
/// Whole-day requests run to local 23:59:59.999. Otherwise an explicit end
/// wins over a duration, and the configured default applies when neither is given.
pub fn booking_span(config: &ClubConfig, req: &BookingRequest) -> Result<Span, EngineError> {
    if req.whole_day {
        let end = config
            .end_of_day(req.start)
            .ok_or_else(|| EngineError::Validation("start is not a valid date".into()))?;
        if req.start >= end {
            return Err(EngineError::Validation("whole-day booking starts at end of day".into()));
        }
        return Ok(Span::new(req.start, end));
    }
    explicit_span(config, req.start, req.end, req.duration)
}

pub fn block_span(config: &ClubConfig, req: &BlockRequest) -> Result<Span, EngineError> {
    explicit_span(config, req.start, req.end, req.duration)
}

fn explicit_span(
    config: &ClubConfig,
    start: Ms,
    end: Option<Ms>,
    duration: Option<Ms>,
) -> Result<Span, EngineError> {
    let end = match (end, duration) {
        (Some(end), _) => end,
        (None, Some(d)) if d <= 0 => {
            return Err(EngineError::Validation("duration must be positive".into()));
        }
        (None, Some(d)) => start
            .checked_add(d)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?,
        (None, None) => start
            .checked_add(config.default_duration())
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?,
    };
    if end <= start {
        return Err(EngineError::Validation("end must be after start".into()));
    }
    Ok(Span::new(start, end))
}

/// Unprivileged callers must book at least the lead time ahead.
pub fn check_lead_time(
    auth: &AuthContext,
    start: Ms,
    now: Ms,
    config: &ClubConfig,
) -> Result<(), EngineError> {
    if auth.is_privileged() || start >= now + config.lead_time() {
        return Ok(());
    }
    Err(EngineError::Policy(format!(
        "bookings must be made at least {} minutes in advance",
        config.lead_time_minutes
    )))
}

/// Whole-day reservations by players may only start from the configured hour.
pub fn check_whole_day_start(
    auth: &AuthContext,
    start: Ms,
    config: &ClubConfig,
) -> Result<(), EngineError> {
    if auth.is_privileged() {
        return Ok(());
    }
    let minute = config
        .minute_of_day(start)
        .ok_or_else(|| EngineError::Validation("start is not a valid date".into()))?;
    if minute < config.whole_day_from_minute {
        return Err(EngineError::Policy(format!(
            "whole-day reservations start at {:02}:{:02} at the earliest",
            config.whole_day_from_minute / 60,
            config.whole_day_from_minute % 60
        )));
    }
    Ok(())
}

pub fn initial_status(auth: &AuthContext, category: Category) -> Status {
    match (auth.is_privileged(), category) {
        (true, Category::Block) => Status::Blocked,
        (true, _) => Status::Confirmed,
        (false, _) => Status::Pending,
    }
}

/// The base occurrence followed by `weeks` weekly repeats.
pub fn expand_weekly(span: Span, weeks: u32) -> Vec<Span> {
    (0..=weeks as i64).map(|w| span.shifted(w * 7 * DAY)).collect()
}

/// Deletion needs ownership or privilege; owners must respect the cutoff.
pub fn check_delete(
    auth: &AuthContext,
    activity: &Activity,
    now: Ms,
    config: &ClubConfig,
) -> Result<(), EngineError> {
    check_owner_or_privileged(auth, activity)?;
    if auth.is_privileged() {
        return Ok(());
    }
    if activity.span.start - now < config.cancel_cutoff() {
        return Err(EngineError::Policy(format!(
            "bookings can only be cancelled up to {} hours before they start",
            config.cancel_cutoff_minutes as f64 / 60.0
        )));
    }
    Ok(())
}

/// Allowed status changes:
///
/// | from      | to        | who                 |
/// |-----------|-----------|---------------------|
/// | PENDING   | CONFIRMED | coach, admin        |
/// | PENDING   | CANCELLED | owner, coach, admin |
/// | CONFIRMED | CANCELLED | coach, admin        |
/// | CONFIRMED | COMPLETED | coach, admin        |
pub fn check_transition(
    auth: &AuthContext,
    activity: &Activity,
    to: Status,
) -> Result<(), EngineError> {
    check_owner_or_privileged(auth, activity)?;
    let allowed = match (activity.status, to) {
        (Status::Pending, Status::Confirmed) => auth.is_privileged(),
        (Status::Pending, Status::Cancelled) => true,
        (Status::Confirmed, Status::Cancelled) | (Status::Confirmed, Status::Completed) => {
            auth.is_privileged()
        }
        _ => {
            return Err(EngineError::InvalidTransition {
                id: activity.id,
                from: activity.status,
                to,
            });
        }
    };
    if !allowed {
        return Err(EngineError::Unauthorized(format!(
            "only staff can mark an activity {}",
            to.as_str()
        )));
    }
    Ok(())
}

fn check_owner_or_privileged(auth: &AuthContext, activity: &Activity) -> Result<(), EngineError> {
    if auth.is_privileged() || activity.owner_id == auth.user_id {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "activity belongs to another user".into(),
        ))
    }
}
