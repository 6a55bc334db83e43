use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::RecordId;
use record::{DurableRecord, RecordFamily, SagaRecord};

use crate::{RecordQuery, Result};

/// Live and archive storage for one family of flat records (tasks or events).
///
/// Writes are optimistic: `update` succeeds only if the stored version equals
/// `record.version`, and returns the record at its new version.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// The family stored in this repository.
    fn family(&self) -> RecordFamily;

    /// Inserts a new record.
    ///
    /// Fails with `StoreError::DuplicateKey` if a record with the same
    /// `(service_name, uuid)` already exists.
    async fn insert(&self, record: &DurableRecord) -> Result<DurableRecord>;

    /// Compare-and-swap write of every mutable column.
    async fn update(&self, record: &DurableRecord) -> Result<DurableRecord>;

    async fn get(&self, id: RecordId) -> Result<Option<DurableRecord>>;

    async fn find_by_uuid(&self, service_name: &str, uuid: &str)
    -> Result<Option<DurableRecord>>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<DurableRecord>>;

    /// Copies the given records into the archive with `archived_at` and deletes
    /// the live rows, atomically. Returns the number of records moved.
    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize>;

    async fn get_archived(&self, id: RecordId) -> Result<Option<DurableRecord>>;
}

/// Extension methods for record repositories.
#[async_trait]
pub trait RecordRepositoryExt: RecordRepository {
    /// Returns true if a live record with this idempotency key exists.
    async fn exists_by_uuid(&self, service_name: &str, uuid: &str) -> Result<bool> {
        Ok(self.find_by_uuid(service_name, uuid).await?.is_some())
    }
}

impl<T: RecordRepository + ?Sized> RecordRepositoryExt for T {}

/// Live and archive storage for sagas and their steps.
///
/// The saga row and its step rows are always written together.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Fails with `StoreError::DuplicateKey` if `(service_name, saga_type, uuid)` exists.
    async fn insert(&self, saga: &SagaRecord) -> Result<SagaRecord>;

    /// Compare-and-swap on the saga row, upserting every step.
    async fn update(&self, saga: &SagaRecord) -> Result<SagaRecord>;

    async fn get(&self, id: RecordId) -> Result<Option<SagaRecord>>;

    async fn find_by_uuid(
        &self,
        service_name: &str,
        saga_type: &str,
        uuid: &str,
    ) -> Result<Option<SagaRecord>>;

    async fn query(&self, query: &RecordQuery) -> Result<Vec<SagaRecord>>;

    /// Moves sagas and their steps into the archive atomically.
    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize>;

    async fn get_archived(&self, id: RecordId) -> Result<Option<SagaRecord>>;
}
