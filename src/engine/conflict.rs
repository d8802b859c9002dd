use crate::config::ClubConfig;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_ACTIVITY_DURATION_MS {
        return Err(EngineError::LimitExceeded("activity longer than a day"));
    }
    Ok(())
}

/// The resource dimensions a proposal is evaluated along.
#[derive(Debug, Clone, Copy)]
pub struct ResourceKeys<'a> {
    pub coach_id: Option<&'a str>,
    pub location_id: &'a str,
}

/// Whether `existing` competes for time with a proposal of `category` on `keys`.
///
/// Hall claims (whole-day, block) contend with everything at their location,
/// and with their coach's sessions anywhere. A normal session contends with the same coach's sessions anywhere, and with
/// hall-wide activities at its own location. Coach-less sessions never match
/// each other on the coach key.
pub fn contends(existing: &Activity, keys: &ResourceKeys<'_>, category: Category) -> bool {
    if !existing.occupies() {
        return false;
    }
    let same_location = existing.location_id == keys.location_id;
    let same_coach = matches!(
        (keys.coach_id, existing.coach_id.as_deref()),
        (Some(proposed), Some(booked)) if proposed == booked
    );
    if category.claims_hall() {
        return same_location || same_coach;
    }
    same_coach || (same_location && existing.is_hall_wide())
}

/// First activity in `scope` that overlaps `proposed` and contends with it.
pub fn find_conflict<'a>(
    proposed: &Span,
    keys: &ResourceKeys<'_>,
    category: Category,
    scope: impl IntoIterator<Item = &'a Activity>,
) -> Option<&'a Activity> {
    scope
        .into_iter()
        .find(|a| a.span.overlaps(proposed) && contends(a, keys, category))
}

pub(crate) fn check_no_conflict(
    schedule: &Schedule,
    span: &Span,
    keys: &ResourceKeys<'_>,
    category: Category,
    config: &ClubConfig,
) -> Result<(), EngineError> {
    match find_conflict(span, keys, category, schedule.overlapping(span)) {
        Some(hit) => Err(EngineError::Conflict {
            id: hit.id,
            span: hit.span,
            reason: describe(hit, config),
        }),
        None => Ok(()),
    }
}

fn describe(hit: &Activity, config: &ClubConfig) -> String {
    let what = if hit.status == Status::Blocked || hit.category == Category::Block {
        format!("hall {} is blocked", hit.location_id)
    } else if hit.category == Category::WholeDay {
        format!("hall {} is reserved until closing", hit.location_id)
    } else if let Some(coach) = &hit.coach_id {
        format!("coach {coach} already has a session")
    } else {
        format!("hall {} is taken", hit.location_id)
    };
    format!(
        "{what} from {} to {}",
        config.format_local(hit.span.start),
        config.format_local(hit.span.end)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const LOC: &str = "bakaric";

    fn act(start: Ms, end: Ms, coach: Option<&str>, location: &str, status: Status, category: Category) -> Activity {
        Activity {
            id: Ulid::new(),
            owner_id: "owner".into(),
            coach_id: coach.map(Into::into),
            location_id: location.into(),
            span: Span::new(start, end),
            status,
            category,
            notes: None,
            participant_count: None,
            table_count: None,
            reminder_sent: false,
        }
    }

    fn session(start: Ms, end: Ms, coach: Option<&str>) -> Activity {
        act(start, end, coach, LOC, Status::Confirmed, Category::Normal)
    }

    fn keys(coach: Option<&'static str>) -> ResourceKeys<'static> {
        ResourceKeys { coach_id: coach, location_id: LOC }
    }

    #[test]
    fn same_coach_overlap_conflicts() {
        let scope = [session(9 * HOUR, 10 * HOUR, Some("c1"))];
        let hit = find_conflict(
            &Span::new(9 * HOUR + 30 * MINUTE, 11 * HOUR),
            &keys(Some("c1")),
            Category::Normal,
            &scope,
        );
        assert_eq!(hit.map(|a| a.id), Some(scope[0].id));
    }

    #[test]
    fn different_coach_overlap_is_fine() {
        let scope = [session(9 * HOUR, 10 * HOUR, Some("c1"))];
        let hit = find_conflict(
            &Span::new(9 * HOUR, 10 * HOUR),
            &keys(Some("c2")),
            Category::Normal,
            &scope,
        );
        assert!(hit.is_none());
    }

    #[test]
    fn coach_is_exclusive_across_locations() {
        let scope = [act(9 * HOUR, 10 * HOUR, Some("c1"), "other-hall", Status::Pending, Category::Normal)];
        let hit = find_conflict(&Span::new(9 * HOUR, 10 * HOUR), &keys(Some("c1")), Category::Normal, &scope);
        assert!(hit.is_some());
    }

    #[test]
    fn coachless_sessions_do_not_contend() {
        let scope = [session(9 * HOUR, 10 * HOUR, None)];
        assert!(find_conflict(&Span::new(9 * HOUR, 10 * HOUR), &keys(None), Category::Normal, &scope).is_none());
    }

    #[test]
    fn touching_sessions_do_not_conflict() {
        let scope = [session(9 * HOUR, 10 * HOUR, Some("c1"))];
        assert!(find_conflict(&Span::new(10 * HOUR, 11 * HOUR), &keys(Some("c1")), Category::Normal, &scope).is_none());
        assert!(find_conflict(&Span::new(8 * HOUR, 9 * HOUR), &keys(Some("c1")), Category::Normal, &scope).is_none());
    }

    #[test]
    fn cancelled_never_conflicts() {
        let mut a = session(9 * HOUR, 10 * HOUR, Some("c1"));
        a.status = Status::Cancelled;
        let span = a.span;
        let scope = [a];
        for category in [Category::Normal, Category::WholeDay, Category::Block] {
            assert!(find_conflict(&span, &keys(Some("c1")), category, &scope).is_none());
        }
    }

    #[test]
    fn completed_still_conflicts() {
        let mut a = session(9 * HOUR, 10 * HOUR, Some("c1"));
        a.status = Status::Completed;
        let span = a.span;
        let scope = [a];
        assert!(find_conflict(&span, &keys(Some("c1")), Category::Normal, &scope).is_some());
    }

    #[test]
    fn hall_block_rejects_every_coach() {
        let scope = [act(7 * HOUR, 9 * HOUR, None, LOC, Status::Blocked, Category::Block)];
        for coach in [None, Some("c1"), Some("c2")] {
            let hit = find_conflict(&Span::new(8 * HOUR, 10 * HOUR), &keys(coach), Category::Normal, &scope);
            assert!(hit.is_some(), "coach {coach:?} should be blocked");
        }
    }

    #[test]
    fn hall_block_at_other_location_is_ignored() {
        let scope = [act(7 * HOUR, 9 * HOUR, None, "other-hall", Status::Blocked, Category::Block)];
        assert!(find_conflict(&Span::new(8 * HOUR, 10 * HOUR), &keys(Some("c1")), Category::Normal, &scope).is_none());
    }

    #[test]
    fn whole_day_reservation_blocks_hall() {
        let scope = [act(18 * HOUR, DAY - 1, None, LOC, Status::Pending, Category::WholeDay)];
        let hit = find_conflict(&Span::new(19 * HOUR, 20 * HOUR), &keys(Some("c1")), Category::Normal, &scope);
        assert!(hit.is_some());
    }

    #[test]
    fn whole_day_proposal_contends_with_any_session_at_location() {
        let scope = [session(20 * HOUR, 21 * HOUR, Some("c7"))];
        let proposal = Span::new(18 * HOUR, DAY - 1);
        assert!(find_conflict(&proposal, &keys(None), Category::WholeDay, &scope).is_some());
        let elsewhere = [act(20 * HOUR, 21 * HOUR, Some("c7"), "other-hall", Status::Confirmed, Category::Normal)];
        assert!(find_conflict(&proposal, &keys(None), Category::WholeDay, &elsewhere).is_none());
    }

    #[test]
    fn hall_claim_contends_with_its_coach_elsewhere() {
        let elsewhere = [act(20 * HOUR, 21 * HOUR, Some("c1"), "other-hall", Status::Confirmed, Category::Normal)];
        let proposal = Span::new(18 * HOUR, DAY - 1);
        for category in [Category::WholeDay, Category::Block] {
            assert!(find_conflict(&proposal, &keys(Some("c1")), category, &elsewhere).is_some());
            assert!(find_conflict(&proposal, &keys(Some("c2")), category, &elsewhere).is_none());
        }
    }

    #[test]
    fn check_no_conflict_explains_rejection() {
        let config = ClubConfig { utc_offset_minutes: 0, ..ClubConfig::default() };
        let mut schedule = Schedule::new();
        schedule.insert(act(7 * HOUR, 9 * HOUR, None, LOC, Status::Blocked, Category::Block));
        let err = check_no_conflict(&schedule, &Span::new(8 * HOUR, 9 * HOUR), &keys(Some("c1")), Category::Normal, &config)
            .unwrap_err();
        match err {
            EngineError::Conflict { span, reason, .. } => {
                assert_eq!(span, Span::new(7 * HOUR, 9 * HOUR));
                assert_eq!(reason, "hall bakaric is blocked from 1970-01-01 07:00 to 1970-01-01 09:00");
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn validate_span_rejects_inverted_and_huge() {
        assert!(matches!(validate_span(&Span { start: 10, end: 10 }), Err(EngineError::Validation(_))));
        assert!(matches!(
            validate_span(&Span { start: 0, end: 2 * DAY }),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(&Span::new(HOUR, 2 * HOUR)).is_ok());
    }
}
