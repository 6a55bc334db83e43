use record::RecordError;
use record_store::StoreError;
use thiserror::Error;

/// Errors that can occur when recording or delivering integration events.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The event could not be encoded or its record refused a transition.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Storage failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience type alias for outbox results.
pub type Result<T> = std::result::Result<T, OutboxError>;
