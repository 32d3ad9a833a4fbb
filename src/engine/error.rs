use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, UnavailableReason};

/// Which table an id was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Service,
    Master,
    Booking,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Service => "service",
            Entity::Master => "master",
            Entity::Booking => "booking",
        })
    }
}

/// Caller-facing classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Storage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot change status from \"{from}\" to \"{to}\"")]
    IllegalTransition { from: BookingStatus, to: BookingStatus },

    #[error("master unavailable: {0}")]
    Unavailable(UnavailableReason),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("{0} not found: {1}")]
    NotFound(Entity, Ulid),

    #[error("{0} already exists: {1}")]
    AlreadyExists(Entity, Ulid),

    #[error("time slot already booked by {0}")]
    SlotTaken(Ulid),

    #[error("{entity} {id} is still referenced by {bookings} booking(s)")]
    Referenced { entity: Entity, id: Ulid, bookings: usize },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::IllegalTransition { .. }
            | EngineError::Unavailable(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::AlreadyExists(..)
            | EngineError::SlotTaken(_)
            | EngineError::Referenced { .. } => ErrorKind::Conflict,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        let id = Ulid::new();
        assert_eq!(EngineError::invalid("bad").kind(), ErrorKind::Validation);
        assert_eq!(
            EngineError::IllegalTransition {
                from: BookingStatus::Pending,
                to: BookingStatus::Completed
            }
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(EngineError::NotFound(Entity::Booking, id).kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::SlotTaken(id).kind(), ErrorKind::Conflict);
        assert_eq!(EngineError::Forbidden("nope").kind(), ErrorKind::Forbidden);
        assert_eq!(EngineError::WalError("disk".into()).kind(), ErrorKind::Storage);
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let msg = EngineError::IllegalTransition {
            from: BookingStatus::Pending,
            to: BookingStatus::Completed,
        }
        .to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("completed"));
    }
}
