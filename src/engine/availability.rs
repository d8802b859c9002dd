use ulid::Ulid;

use crate::model::*;

// ── Slot generation ───────────────────────────────────────────────

/// Parameters of one slot walk. All values are absolute unix ms except `step`
/// and `duration`, which are lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotQuery {
    /// Opening hours of the day being walked.
    pub window: Span,
    pub step: Ms,
    /// Earliest start at which whole-day reservations are offered.
    pub whole_day_from: Ms,
    /// Length the caller wants to book, if known.
    pub duration: Option<Ms>,
    /// Slots starting before this instant are not bookable (lead time).
    pub earliest: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Occupied(Ulid),
    Free { max_duration: Ms },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub time: Ms,
    pub kind: SlotKind,
    pub bookable: bool,
    /// Free, but shorter than the minimum bookable unit.
    pub locked: bool,
    pub whole_day: bool,
}

impl Slot {
    pub fn max_duration(&self) -> Ms {
        match self.kind {
            SlotKind::Free { max_duration } => max_duration,
            SlotKind::Occupied(_) => 0,
        }
    }

    pub fn occupied_by(&self) -> Option<Ulid> {
        match self.kind {
            SlotKind::Occupied(id) => Some(id),
            SlotKind::Free { .. } => None,
        }
    }
}

/// Walk the window in `step` increments and annotate every position.
///
/// `scope` holds the activities that compete with the selected resource;
/// `hall` holds every activity at the location and decides whole-day
/// eligibility. Both are expected to be non-cancelled, but cancelled entries
/// are ignored anyway.
pub fn generate_slots(query: &SlotQuery, scope: &[&Activity], hall: &[&Activity]) -> Vec<Slot> {
    let window = query.window;
    if query.step <= 0 {
        return Vec::new();
    }

    let positions: Vec<Ms> = (0..)
        .map(|i: i64| window.start + i * query.step)
        .take_while(|t| *t < window.end)
        .collect();

    let occupants: Vec<Option<Ulid>> = positions
        .iter()
        .map(|&t| scope.iter().find(|a| a.occupies_instant(t)).map(|a| a.id))
        .collect();

    // next_busy[i]: first occupied position after i, or window end
    let mut next_busy = vec![window.end; positions.len()];
    let mut upcoming = window.end;
    for i in (0..positions.len()).rev() {
        next_busy[i] = upcoming;
        if occupants[i].is_some() {
            upcoming = positions[i];
        }
    }

    let not_before = |t: Ms| query.earliest.is_none_or(|e| t >= e);

    positions
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            if let Some(id) = occupants[i] {
                return Slot {
                    time: t,
                    kind: SlotKind::Occupied(id),
                    bookable: false,
                    locked: false,
                    whole_day: false,
                };
            }

            // An activity starting between two step positions still cuts the gap.
            let limit = scope
                .iter()
                .filter(|a| a.occupies() && a.span.start > t && a.span.start < next_busy[i])
                .map(|a| a.span.start)
                .min()
                .unwrap_or(next_busy[i]);
            let max_duration = limit - t;
            let locked = max_duration < query.step;
            let bookable = !locked
                && query.duration.is_none_or(|d| max_duration >= d)
                && not_before(t);

            Slot {
                time: t,
                kind: SlotKind::Free { max_duration },
                bookable,
                locked,
                whole_day: t >= query.whole_day_from
                    && not_before(t)
                    && hall_free_until_close(hall, t, window.end),
            }
        })
        .collect()
}

/// No hall activity occupies any instant in `[t, close)`.
fn hall_free_until_close(hall: &[&Activity], t: Ms, close: Ms) -> bool {
    !hall
        .iter()
        .any(|a| a.occupies() && a.span.start < close && a.span.end - MINUTE >= t)
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE;
    const H: Ms = HOUR;

    fn act(start: Ms, end: Ms, status: Status, category: Category) -> Activity {
        Activity {
            id: Ulid::new(),
            owner_id: "owner".into(),
            coach_id: Some("c1".into()),
            location_id: "bakaric".into(),
            span: Span::new(start, end),
            status,
            category,
            notes: None,
            participant_count: None,
            table_count: None,
            reminder_sent: false,
        }
    }

    fn booking(start: Ms, end: Ms) -> Activity {
        act(start, end, Status::Confirmed, Category::Normal)
    }

    /// 07:00–24:00 on day zero, 30-minute steps, whole-day from 18:00.
    fn day_query() -> SlotQuery {
        SlotQuery {
            window: Span::new(7 * H, 24 * H),
            step: 30 * M,
            whole_day_from: 18 * H,
            duration: None,
            earliest: None,
        }
    }

    fn slot_at(slots: &[Slot], t: Ms) -> Slot {
        *slots.iter().find(|s| s.time == t).expect("slot exists")
    }

    #[test]
    fn empty_day_is_all_free() {
        let slots = generate_slots(&day_query(), &[], &[]);
        assert_eq!(slots.len(), 34);
        assert_eq!(slots[0].time, 7 * H);
        assert_eq!(slots[0].max_duration(), 17 * H);
        assert_eq!(slots[33].time, 23 * H + 30 * M);
        assert_eq!(slots[33].max_duration(), 30 * M);
        assert!(slots.iter().all(|s| s.bookable && !s.locked));
    }

    #[test]
    fn block_occupies_until_its_last_minute() {
        let block = act(7 * H, 9 * H, Status::Blocked, Category::Block);
        let scope = [&block];
        let slots = generate_slots(&day_query(), &scope, &scope);

        for t in [7 * H, 7 * H + 30 * M, 8 * H, 8 * H + 30 * M] {
            assert_eq!(slot_at(&slots, t).occupied_by(), Some(block.id));
        }
        let nine = slot_at(&slots, 9 * H);
        assert_eq!(nine.kind, SlotKind::Free { max_duration: 900 * M });
        assert!(nine.bookable);
    }

    #[test]
    fn free_slot_stops_at_next_occupied_slot() {
        let b = booking(12 * H, 13 * H);
        let scope = [&b];
        let slots = generate_slots(&day_query(), &scope, &scope);
        assert_eq!(slot_at(&slots, 10 * H).max_duration(), 2 * H);
        assert_eq!(slot_at(&slots, 11 * H + 30 * M).max_duration(), 30 * M);
        assert_eq!(slot_at(&slots, 13 * H).max_duration(), 11 * H);
    }

    #[test]
    fn off_grid_start_cuts_gap() {
        let b = booking(10 * H + 15 * M, 11 * H);
        let scope = [&b];
        let slots = generate_slots(&day_query(), &scope, &scope);
        let ten = slot_at(&slots, 10 * H);
        assert_eq!(ten.max_duration(), 15 * M);
        assert!(ten.locked);
        assert!(!ten.bookable);
    }

    #[test]
    fn requested_duration_controls_bookable() {
        let b = booking(12 * H, 13 * H);
        let scope = [&b];
        let query = SlotQuery { duration: Some(90 * M), ..day_query() };
        let slots = generate_slots(&query, &scope, &scope);
        assert!(slot_at(&slots, 10 * H).bookable);
        assert!(slot_at(&slots, 10 * H + 30 * M).bookable);
        assert!(!slot_at(&slots, 11 * H).bookable);
        assert!(!slot_at(&slots, 11 * H).locked);
    }

    #[test]
    fn earliest_hides_past_slots() {
        let query = SlotQuery { earliest: Some(10 * H + 5 * M), ..day_query() };
        let slots = generate_slots(&query, &[], &[]);
        assert!(!slot_at(&slots, 10 * H).bookable);
        assert!(slot_at(&slots, 10 * H + 30 * M).bookable);
    }

    #[test]
    fn whole_day_only_from_configured_hour() {
        let slots = generate_slots(&day_query(), &[], &[]);
        assert!(!slot_at(&slots, 17 * H + 30 * M).whole_day);
        assert!(slot_at(&slots, 18 * H).whole_day);
        assert!(slot_at(&slots, 23 * H + 30 * M).whole_day);
    }

    #[test]
    fn whole_day_needs_hall_free_until_close() {
        // Another coach's session late in the evening: ordinary booking still
        // possible for this coach, whole-day is not.
        let mut late = booking(21 * H, 22 * H);
        late.coach_id = Some("c2".into());
        let hall = [&late];
        let slots = generate_slots(&day_query(), &[], &hall);

        let six = slot_at(&slots, 18 * H);
        assert!(six.bookable);
        assert!(!six.whole_day);
        assert!(!slot_at(&slots, 21 * H + 30 * M).whole_day);
        assert!(slot_at(&slots, 22 * H).whole_day);
    }

    #[test]
    fn cancelled_activities_are_ignored() {
        let b = act(9 * H, 10 * H, Status::Cancelled, Category::Normal);
        let scope = [&b];
        let slots = generate_slots(&day_query(), &scope, &scope);
        assert!(slots.iter().all(|s| s.occupied_by().is_none()));
        assert!(slot_at(&slots, 18 * H).whole_day);
    }

    #[test]
    fn generation_is_deterministic() {
        let a = booking(9 * H, 10 * H + 30 * M);
        let b = act(14 * H, 16 * H, Status::Blocked, Category::Block);
        let scope = [&a, &b];
        let first = generate_slots(&day_query(), &scope, &scope);
        let second = generate_slots(&day_query(), &scope, &scope);
        assert_eq!(first, second);
    }

    #[test]
    fn uneven_window_end_locks_last_slot() {
        let query = SlotQuery { window: Span::new(7 * H, 22 * H + 15 * M), ..day_query() };
        let slots = generate_slots(&query, &[], &[]);
        let last = slots.last().copied().unwrap();
        assert_eq!(last.time, 22 * H);
        assert_eq!(last.max_duration(), 15 * M);
        assert!(last.locked);
        // whole-day ignores the minimum unit
        assert!(last.whole_day);
    }
}
