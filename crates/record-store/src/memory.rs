use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::RecordId;
use record::{DurableRecord, RecordFamily, SagaRecord};
use tokio::sync::RwLock;

use crate::{
    LeaseLockStore, PartitionManager, RecordQuery, RecordRepository, Result, SagaRepository,
    StoreError, partition_name,
};

/// In-memory record repository for testing.
///
/// Behaves like the PostgreSQL implementation, including version checks,
/// idempotency-key uniqueness and atomic archival.
#[derive(Clone)]
pub struct InMemoryRecordRepository {
    family: RecordFamily,
    live: Arc<RwLock<HashMap<RecordId, DurableRecord>>>,
    archived: Arc<RwLock<HashMap<RecordId, (DurableRecord, DateTime<Utc>)>>>,
}

impl InMemoryRecordRepository {
    /// Creates a new empty repository for `family`.
    pub fn new(family: RecordFamily) -> Self {
        Self {
            family,
            live: Arc::default(),
            archived: Arc::default(),
        }
    }

    /// Returns the number of live records.
    pub async fn len(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.live.read().await.is_empty()
    }

    /// Returns the number of archived records.
    pub async fn archived_len(&self) -> usize {
        self.archived.read().await.len()
    }
}

#[async_trait]
impl RecordRepository for InMemoryRecordRepository {
    fn family(&self) -> RecordFamily {
        self.family
    }

    async fn insert(&self, record: &DurableRecord) -> Result<DurableRecord> {
        let mut live = self.live.write().await;

        if let Some(ref uuid) = record.uuid
            && live
                .values()
                .any(|r| r.service_name == record.service_name && r.uuid.as_ref() == Some(uuid))
        {
            return Err(StoreError::DuplicateKey {
                service_name: record.service_name.clone(),
                uuid: uuid.clone(),
            });
        }

        let mut stored = record.clone();
        stored.version = record.version.next();
        live.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &DurableRecord) -> Result<DurableRecord> {
        let mut live = self.live.write().await;
        let current = live
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;

        if current.version != record.version {
            return Err(StoreError::Conflict {
                id: record.id,
                expected: record.version,
                actual: current.version,
            });
        }

        let mut stored = record.clone();
        stored.version = record.version.next();
        *current = stored.clone();
        Ok(stored)
    }

    async fn get(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        Ok(self.live.read().await.get(&id).cloned())
    }

    async fn find_by_uuid(
        &self,
        service_name: &str,
        uuid: &str,
    ) -> Result<Option<DurableRecord>> {
        let live = self.live.read().await;
        Ok(live
            .values()
            .find(|r| r.service_name == service_name && r.uuid.as_deref() == Some(uuid))
            .cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<DurableRecord>> {
        let live = self.live.read().await;
        let mut records: Vec<_> = live.values().filter(|r| query.matches(r)).cloned().collect();
        records.sort_by(|a, b| {
            (a.lifecycle.created_at, a.id).cmp(&(b.lifecycle.created_at, b.id))
        });
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize> {
        let mut live = self.live.write().await;
        let mut archived = self.archived.write().await;

        let mut moved = 0;
        for id in ids {
            if let Some(record) = live.remove(id) {
                archived.insert(*id, (record, archived_at));
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn get_archived(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        Ok(self
            .archived
            .read()
            .await
            .get(&id)
            .map(|(record, _)| record.clone()))
    }
}

/// In-memory saga repository for testing.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    live: Arc<RwLock<HashMap<RecordId, SagaRecord>>>,
    archived: Arc<RwLock<HashMap<RecordId, (SagaRecord, DateTime<Utc>)>>>,
}

impl InMemorySagaRepository {
    /// Creates a new empty saga repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live sagas.
    pub async fn len(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.live.read().await.is_empty()
    }

    /// Returns the number of archived sagas.
    pub async fn archived_len(&self) -> usize {
        self.archived.read().await.len()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn insert(&self, saga: &SagaRecord) -> Result<SagaRecord> {
        let mut live = self.live.write().await;

        if live.values().any(|s| {
            s.record.service_name == saga.record.service_name
                && s.saga_type() == saga.saga_type()
                && s.uuid() == saga.uuid()
        }) {
            return Err(StoreError::DuplicateKey {
                service_name: saga.record.service_name.clone(),
                uuid: saga.uuid().to_string(),
            });
        }

        let mut stored = saga.clone();
        stored.record.version = saga.record.version.next();
        live.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, saga: &SagaRecord) -> Result<SagaRecord> {
        let mut live = self.live.write().await;
        let current = live
            .get_mut(&saga.id())
            .ok_or(StoreError::NotFound(saga.id()))?;

        if current.record.version != saga.record.version {
            return Err(StoreError::Conflict {
                id: saga.id(),
                expected: saga.record.version,
                actual: current.record.version,
            });
        }

        let mut stored = saga.clone();
        stored.record.version = saga.record.version.next();
        *current = stored.clone();
        Ok(stored)
    }

    async fn get(&self, id: RecordId) -> Result<Option<SagaRecord>> {
        Ok(self.live.read().await.get(&id).cloned())
    }

    async fn find_by_uuid(
        &self,
        service_name: &str,
        saga_type: &str,
        uuid: &str,
    ) -> Result<Option<SagaRecord>> {
        let live = self.live.read().await;
        Ok(live
            .values()
            .find(|s| {
                s.record.service_name == service_name
                    && s.saga_type() == saga_type
                    && s.uuid() == uuid
            })
            .cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<SagaRecord>> {
        let live = self.live.read().await;
        let mut sagas: Vec<_> = live
            .values()
            .filter(|s| query.matches(&s.record))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| {
            (a.record.lifecycle.created_at, a.id()).cmp(&(b.record.lifecycle.created_at, b.id()))
        });
        if let Some(limit) = query.limit {
            sagas.truncate(limit);
        }
        Ok(sagas)
    }

    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize> {
        let mut live = self.live.write().await;
        let mut archived = self.archived.write().await;

        let mut moved = 0;
        for id in ids {
            if let Some(saga) = live.remove(id) {
                archived.insert(*id, (saga, archived_at));
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn get_archived(&self, id: RecordId) -> Result<Option<SagaRecord>> {
        Ok(self
            .archived
            .read()
            .await
            .get(&id)
            .map(|(saga, _)| saga.clone()))
    }
}

#[derive(Debug, Clone)]
struct LockRow {
    token: String,
    unlock_at: DateTime<Utc>,
}

/// In-memory lease lock for testing.
#[derive(Clone, Default)]
pub struct InMemoryLeaseLock {
    rows: Arc<RwLock<HashMap<String, LockRow>>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token currently holding `name`, if any.
    pub async fn holder(&self, name: &str) -> Option<String> {
        self.rows.read().await.get(name).map(|r| r.token.clone())
    }
}

#[async_trait]
impl LeaseLockStore for InMemoryLeaseLock {
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let free = rows
            .get(name)
            .is_none_or(|row| row.unlock_at <= now || row.token == token);
        if free {
            rows.insert(
                name.to_string(),
                LockRow {
                    token: token.to_string(),
                    unlock_at: now + ttl,
                },
            );
        }
        Ok(free)
    }

    async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let mut rows = self.rows.write().await;
        if rows.get(name).is_some_and(|row| row.token == token) {
            rows.remove(name);
            return Ok(true);
        }
        Ok(false)
    }
}

/// In-memory partition registry for testing.
#[derive(Clone, Default)]
pub struct InMemoryPartitionManager {
    created: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn partitions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.created.read().await.iter().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PartitionManager for InMemoryPartitionManager {
    async fn ensure_monthly_partition(&self, table: &str, month: NaiveDate) -> Result<bool> {
        if !crate::ARCHIVE_TABLES.contains(&table) {
            return Err(StoreError::InvalidTable(table.to_string()));
        }
        Ok(self.created.write().await.insert(partition_name(table, month)))
    }
}
