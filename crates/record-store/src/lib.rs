//! Storage collaborator for durable records.
//!
//! Provides CRUD with optimistic-version compare-and-swap, predicate queries
//! with keyset paging, an atomic copy-then-delete archive migration, the lease
//! lock table and archive partition rotation. Every trait has an in-memory
//! implementation for tests and a PostgreSQL one built on `sqlx`.

pub mod error;
pub mod lock;
pub mod memory;
pub mod partition;
pub mod postgres;
pub mod query;
pub mod repository;
pub mod stores;

pub use error::{Result, StoreError};
pub use lock::{LeaseLockStore, LeaseToken, lock_name};
pub use memory::{
    InMemoryLeaseLock, InMemoryPartitionManager, InMemoryRecordRepository, InMemorySagaRepository,
};
pub use partition::{ARCHIVE_TABLES, PartitionManager, month_start, next_month, partition_name};
pub use postgres::{
    PostgresLeaseLock, PostgresPartitionManager, PostgresRecordRepository, PostgresSagaRepository,
    run_migrations,
};
pub use query::{Cursor, RecordQuery};
pub use repository::{RecordRepository, RecordRepositoryExt, SagaRepository};
pub use stores::Stores;
