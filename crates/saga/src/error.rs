//! Saga error types.

use common::RecordId;
use record::RecordError;
use record_store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// Forward and compensating handler failures are not errors at this level;
/// they are recorded on the step and drive the saga's state instead.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A step that ran has no compensating handler. The saga is left `FAILED`.
    #[error("Saga {saga_id} step {code} ran but has no rollback handler")]
    MissingCompensation { saga_id: RecordId, code: i32 },

    /// A persisted saga was handed to a state machine for another saga type
    /// or context type.
    #[error("Saga {saga_id} type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        saga_id: RecordId,
        expected: String,
        actual: String,
    },

    /// No state machine is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// No state machine accepts the context type.
    #[error("No saga registered for context type: {0}")]
    UnknownContext(String),

    /// More than one state machine accepts the context type.
    #[error("Several sagas accept context type {0}; run it by saga type")]
    AmbiguousContext(String),

    /// Two state machines were registered for the same saga type.
    #[error("Saga type already registered: {0}")]
    DuplicateSagaType(String),

    /// The process graph is malformed.
    #[error("Invalid saga process graph: {0}")]
    InvalidGraph(String),

    /// No saga exists for the given key.
    #[error("Saga not found: {0}")]
    NotFound(String),

    /// Record state or payload error.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Storage error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
