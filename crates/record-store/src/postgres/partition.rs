use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;

use crate::partition::{ARCHIVE_TABLES, next_month, partition_name};
use crate::{PartitionManager, Result, StoreError};

/// SQLSTATE for `duplicate_table`.
const DUPLICATE_TABLE: &str = "42P07";

#[derive(Clone)]
pub struct PostgresPartitionManager {
    pool: PgPool,
}

impl PostgresPartitionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PartitionManager for PostgresPartitionManager {
    async fn ensure_monthly_partition(&self, table: &str, month: NaiveDate) -> Result<bool> {
        if !ARCHIVE_TABLES.contains(&table) {
            return Err(StoreError::InvalidTable(format!(
                "{table} is not a partitioned archive table"
            )));
        }

        let name = partition_name(table, month);
        let existing: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&name)
            .fetch_one(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let from = month.format("%Y-%m-%d");
        let to = next_month(month).format("%Y-%m-%d");
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF {table} \
             FOR VALUES FROM ('{from} 00:00:00+00') TO ('{to} 00:00:00+00')"
        );

        match sqlx::raw_sql(&sql).execute(&self.pool).await {
            Ok(_) => {
                tracing::info!(partition = %name, "Created archive partition");
                Ok(true)
            }
            // Another instance created it between the check and the create.
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(DUPLICATE_TABLE) =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
