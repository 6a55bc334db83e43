use std::sync::Arc;

use record::RecordFamily;
use sqlx::PgPool;

use crate::{
    InMemoryLeaseLock, InMemoryPartitionManager, InMemoryRecordRepository, InMemorySagaRepository,
    LeaseLockStore, PartitionManager, PostgresLeaseLock, PostgresPartitionManager,
    PostgresRecordRepository, PostgresSagaRepository, RecordRepository, Result, SagaRepository,
};

/// Every store a service needs, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn RecordRepository>,
    pub events: Arc<dyn RecordRepository>,
    pub sagas: Arc<dyn SagaRepository>,
    pub locks: Arc<dyn LeaseLockStore>,
    pub partitions: Arc<dyn PartitionManager>,
}

impl Stores {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(InMemoryRecordRepository::new(RecordFamily::Task)),
            events: Arc::new(InMemoryRecordRepository::new(RecordFamily::Event)),
            sagas: Arc::new(InMemorySagaRepository::new()),
            locks: Arc::new(InMemoryLeaseLock::new()),
            partitions: Arc::new(InMemoryPartitionManager::new()),
        }
    }

    /// Stores sharing one PostgreSQL pool. Migrations are not run here.
    pub fn postgres(pool: PgPool) -> Result<Self> {
        Ok(Self {
            tasks: Arc::new(PostgresRecordRepository::new(pool.clone(), RecordFamily::Task)?),
            events: Arc::new(PostgresRecordRepository::new(
                pool.clone(),
                RecordFamily::Event,
            )?),
            sagas: Arc::new(PostgresSagaRepository::new(pool.clone())),
            locks: Arc::new(PostgresLeaseLock::new(pool.clone())),
            partitions: Arc::new(PostgresPartitionManager::new(pool)),
        })
    }
}
