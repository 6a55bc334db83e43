//! PostgreSQL implementations of the storage traits.

mod lock;
mod partition;
mod records;
mod rows;
mod sagas;

pub use lock::PostgresLeaseLock;
pub use partition::PostgresPartitionManager;
pub use records::PostgresRecordRepository;
pub use sagas::PostgresSagaRepository;

use sqlx::PgPool;

use crate::Result;

/// Runs the workspace migrations against `pool`.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
