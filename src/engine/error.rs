use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, PaymentStatus, Role};

use super::proposal::Proposal;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("forbidden: {role} may not {action}")]
    Forbidden { role: Role, action: String },
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("payment failure: {0}")]
    PaymentFailure(String),
    #[error("payment {payment} is {actual}, expected {expected}")]
    PaymentState {
        payment: Ulid,
        expected: PaymentStatus,
        actual: PaymentStatus,
    },
    #[error("schedule conflict for booking {booking}: slot no longer free")]
    Conflict {
        booking: Ulid,
        fresh: Option<Box<Proposal>>,
    },
    #[error("notification failed: {0}")]
    Notification(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("answers already submitted for booking {0}")]
    AlreadySubmitted(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }
}
