use record::RecordError;
use record_store::StoreError;
use saga::SagaError;
use thiserror::Error;

/// Errors that abort a sweep tick.
///
/// Handler failures never surface here; they are recorded on the record.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No periodic job is registered under this name.
    #[error("Unknown periodic job: {0}")]
    UnknownJob(String),

    /// A storage error occurred.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be decoded or transitioned.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// A saga pass could not be claimed or scheduled.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
