use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Service,
    Category,
    Appointment,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Service => "service",
            Entity::Category => "category",
            Entity::Appointment => "appointment",
        })
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Missing, or owned by someone else.
    NotFound(Entity, Ulid),
    Conflict {
        service_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
    },
    /// Operation not allowed for the current status, or a business rule
    /// (notice period, already reviewed) forbids it.
    InvalidState(&'static str),
    ValidationFailed(String),
    LimitExceeded(&'static str),
    /// The journal could not commit. Nothing was applied.
    DependencyFailure(String),
}

impl EngineError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::ValidationFailed(_) => "validation_failed",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::DependencyFailure(_) => "dependency_failure",
        }
    }

    /// Expected outcomes the caller can act on; only dependency failures
    /// warrant a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::DependencyFailure(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::Conflict {
                service_id,
                date,
                start,
            } => write!(
                f,
                "time slot {date} {} not available for service {service_id}",
                start.format("%H:%M")
            ),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::DependencyFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
