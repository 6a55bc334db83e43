use common::RecordId;
use record::{RecordError, Version};
use thiserror::Error;

/// Errors that can occur when interacting with record storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version moved on since the record was read.
    /// The caller must re-read and retry the mutation.
    #[error("Version conflict for record {id}: expected version {expected}, found {actual}")]
    Conflict {
        id: RecordId,
        expected: Version,
        actual: Version,
    },

    /// The record was not found.
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// A record with the same idempotency key already exists.
    #[error("Duplicate idempotency key '{uuid}' for service {service_name}")]
    DuplicateKey { service_name: String, uuid: String },

    /// The operation does not apply to this table or record family.
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    /// A stored row could not be turned back into a record.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for optimistic-concurrency clashes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
