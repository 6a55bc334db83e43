use record::RecordError;
use record_store::StoreError;
use thiserror::Error;

/// Errors that can occur when submitting or running tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No handler is registered for the record's kind.
    #[error("No task handler registered for kind '{0}'")]
    UnknownKind(String),

    /// A second handler was registered under an existing kind.
    #[error("Task handler already registered for kind '{0}'")]
    DuplicateKind(String),

    /// No task exists with the given idempotency key.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// The record refused the transition (exhausted, expired, bad payload).
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Storage failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience type alias for task results.
pub type Result<T> = std::result::Result<T, TaskError>;
