use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::RecordState;

/// Errors raised by record state transitions and payload decoding.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The attempt budget is used up. The record is now `FAILED`.
    #[error("Retries exhausted: tried {tried} of {max} times")]
    RetriesExhausted { tried: u32, max: u32 },

    /// The absolute deadline passed. The record is now `EXPIRED`.
    #[error("Record expired at {expire_at}")]
    Expired { expire_at: DateTime<Utc> },

    /// A payload was decoded as a type other than the one it was stored as.
    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A transition was requested that the record's family does not support.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: RecordState, to: RecordState },

    /// A state code read from storage is unknown.
    #[error("Unknown state code {0}")]
    UnknownStateCode(i16),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecordError {
    /// Returns true if the error moved the record into a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordError::RetriesExhausted { .. } | RecordError::Expired { .. }
        )
    }
}

/// Result type for record operations.
pub type Result<T> = std::result::Result<T, RecordError>;
