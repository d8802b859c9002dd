use ulid::Ulid;

use crate::model::{Span, Status};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing request data, rejected before the schedule is touched.
    Validation(String),
    /// Caller lacks the role or ownership the operation needs.
    Unauthorized(String),
    /// A timing rule (lead time, cancellation cutoff, whole-day hours) was broken.
    Policy(String),
    Conflict {
        id: Ulid,
        span: Span,
        reason: String,
    },
    NotFound(Ulid),
    InvalidTransition {
        id: Ulid,
        from: Status,
        to: Status,
    },
    ReminderAlreadySent(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "22023",
            EngineError::Unauthorized(_) => "42501",
            EngineError::Policy(_) => "P0001",
            EngineError::Conflict { .. } => "23P01",
            EngineError::NotFound(_) => "P0002",
            EngineError::InvalidTransition { .. } | EngineError::ReminderAlreadySent(_) => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "XX000",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Policy(_) => "policy",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ReminderAlreadySent(_) => "reminder_already_sent",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "store",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Unauthorized(msg) => write!(f, "not allowed: {msg}"),
            EngineError::Policy(msg) => write!(f, "{msg}"),
            EngineError::Conflict { reason, .. } => write!(f, "time slot unavailable: {reason}"),
            EngineError::NotFound(id) => write!(f, "activity not found: {id}"),
            EngineError::InvalidTransition { id, from, to } => write!(
                f,
                "activity {id} cannot go from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::ReminderAlreadySent(id) => {
                write!(f, "reminder already sent for activity {id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
