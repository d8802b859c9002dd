use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

pub type UserId = String;
pub type CoachId = String;
pub type LocationId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Same span moved by `offset` milliseconds.
    pub fn shifted(&self, offset: Ms) -> Span {
        Span::new(self.start + offset, self.end + offset)
    }
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Player,
    Coach,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "player" | "user" | "member" => Some(Role::Player),
            "coach" => Some(Role::Coach),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Coach => "coach",
            Role::Admin => "admin",
        }
    }

    /// Coaches and admins may book for others, skip the lead time and manage blocks.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Coach | Role::Admin)
    }
}

/// Who is asking. Every engine operation receives one explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub role: Role,
}

impl AuthContext {
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}

// ── Activities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Confirmed,
    Blocked,
    Cancelled,
    Completed,
}

impl Status {
    pub fn parse(s: &str) -> Option<Status> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Status::Pending),
            "CONFIRMED" => Some(Status::Confirmed),
            "BLOCKED" => Some(Status::Blocked),
            "CANCELLED" | "CANCELED" => Some(Status::Cancelled),
            "COMPLETED" => Some(Status::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Confirmed => "CONFIRMED",
            Status::Blocked => "BLOCKED",
            Status::Cancelled => "CANCELLED",
            Status::Completed => "COMPLETED",
        }
    }

    /// Only cancelled activities release their interval. Completed ones keep it.
    pub fn occupies(&self) -> bool {
        !matches!(self, Status::Cancelled)
    }
}

/// What kind of claim an activity makes on its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    /// Regular session, contends only with its coach's other sessions.
    Normal,
    /// Hall reserved from the start time until the end of the day.
    WholeDay,
    /// Staff-created hall block.
    Block,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Normal => "NORMAL",
            Category::WholeDay => "WHOLE_DAY",
            Category::Block => "BLOCK",
        }
    }

    pub fn claims_hall(&self) -> bool {
        matches!(self, Category::WholeDay | Category::Block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    pub owner_id: UserId,
    pub coach_id: Option<CoachId>,
    pub location_id: LocationId,
    pub span: Span,
    pub status: Status,
    pub category: Category,
    pub notes: Option<String>,
    pub participant_count: Option<u32>,
    pub table_count: Option<u32>,
    pub reminder_sent: bool,
}

impl Activity {
    pub fn occupies(&self) -> bool {
        self.status.occupies()
    }

    /// Blocks the whole location regardless of coach.
    pub fn is_hall_wide(&self) -> bool {
        self.status == Status::Blocked || self.category.claims_hall()
    }

    /// Slot-matching occupancy: the last minute of an activity still counts as
    /// taken, so a step landing exactly on `end` is free.
    pub fn occupies_instant(&self, t: Ms) -> bool {
        self.occupies() && self.span.start <= t && t <= self.span.end - MINUTE
    }
}

/// All activities of one club, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub activities: Vec<Activity>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Insert activity maintaining sort order by span.start.
    pub fn insert(&mut self, activity: Activity) {
        let pos = self
            .activities
            .partition_point(|a| a.span.start <= activity.span.start);
        self.activities.insert(pos, activity);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Activity> {
        let pos = self.activities.iter().position(|a| a.id == id)?;
        Some(self.activities.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Activity> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Activity> {
        self.activities.iter_mut().find(|a| a.id == id)
    }

    /// Return only activities whose span overlaps the query window, cancelled ones included.
    /// Uses binary search to skip activities starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Activity> {
        let right_bound = self
            .activities
            .partition_point(|a| a.span.start < query.end);
        self.activities[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// A booking as submitted by a caller, before policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookingRequest {
    pub start: Ms,
    pub end: Option<Ms>,
    pub duration: Option<Ms>,
    pub coach_id: Option<CoachId>,
    pub location_id: Option<LocationId>,
    pub notes: Option<String>,
    pub whole_day: bool,
    pub participant_count: Option<u32>,
    pub table_count: Option<u32>,
    pub target_user_id: Option<UserId>,
}

/// A hall block as submitted by staff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockRequest {
    pub start: Ms,
    pub end: Option<Ms>,
    pub duration: Option<Ms>,
    pub location_id: Option<LocationId>,
    pub coach_id: Option<CoachId>,
    pub notes: Option<String>,
    pub recurring: bool,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ActivityCreated { activity: Activity },
    StatusChanged { id: Ulid, status: Status },
    ActivityDeleted { id: Ulid },
    ReminderMarked { id: Ulid },
}
