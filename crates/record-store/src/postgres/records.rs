use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::RecordId;
use record::{DurableRecord, RecordFamily, Version};
use sqlx::PgPool;
use uuid::Uuid;

use super::rows::{
    RECORD_COLUMNS, bind_query, bind_record, map_duplicate, record_from_row, record_tables,
    select_sql, to_db_count,
};
use crate::{RecordQuery, RecordRepository, Result, StoreError};

/// PostgreSQL-backed repository for one flat record family.
#[derive(Clone)]
pub struct PostgresRecordRepository {
    pool: PgPool,
    family: RecordFamily,
    table: &'static str,
    archive_table: &'static str,
}

impl PostgresRecordRepository {
    /// Creates a repository for task or event records.
    pub fn new(pool: PgPool, family: RecordFamily) -> Result<Self> {
        let (table, archive_table) = record_tables(family)?;
        Ok(Self {
            pool,
            family,
            table,
            archive_table,
        })
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn unique_constraint(&self) -> String {
        format!("uq_{}_service_uuid", self.table)
    }
}

#[async_trait]
impl RecordRepository for PostgresRecordRepository {
    fn family(&self) -> RecordFamily {
        self.family
    }

    async fn insert(&self, record: &DurableRecord) -> Result<DurableRecord> {
        let mut stored = record.clone();
        stored.version = record.version.next();

        let sql = format!(
            "INSERT INTO {} ({RECORD_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
            self.table
        );
        bind_record(sqlx::query(&sql), &stored)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_duplicate(
                    e,
                    &self.unique_constraint(),
                    &record.service_name,
                    record.uuid.as_deref(),
                )
            })?;

        Ok(stored)
    }

    async fn update(&self, record: &DurableRecord) -> Result<DurableRecord> {
        let lc = &record.lifecycle;
        let sql = format!(
            r#"
            UPDATE {} SET
                uuid = $3, payload_type = $4, payload = $5, result_type = $6, result = $7,
                state = $8, expire_at = $9, last_try_time = $10, next_try_time = $11,
                try_times = $12, tried_times = $13, last_error = $14, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.version.as_i64())
            .bind(record.uuid.clone())
            .bind(record.payload.type_tag.clone())
            .bind(record.payload.data.clone())
            .bind(record.result.as_ref().map(|p| p.type_tag.clone()))
            .bind(record.result.as_ref().map(|p| p.data.clone()))
            .bind(lc.state.code())
            .bind(lc.expire_at)
            .bind(lc.last_try_time)
            .bind(lc.next_try_time)
            .bind(to_db_count(lc.try_times))
            .bind(to_db_count(lc.tried_times))
            .bind(lc.last_error.clone())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar(&format!("SELECT version FROM {} WHERE id = $1", self.table))
                    .bind(record.id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match actual {
                Some(actual) => StoreError::Conflict {
                    id: record.id,
                    expected: record.version,
                    actual: Version::new(actual),
                },
                None => StoreError::NotFound(record.id),
            });
        }

        let mut stored = record.clone();
        stored.version = record.version.next();
        Ok(stored)
    }

    async fn get(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r, self.family)).transpose()
    }

    async fn find_by_uuid(
        &self,
        service_name: &str,
        uuid: &str,
    ) -> Result<Option<DurableRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE service_name = $1 AND uuid = $2",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(service_name)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r, self.family)).transpose()
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<DurableRecord>> {
        let sql = select_sql(self.table, query);
        let rows = bind_query(sqlx::query(&sql), query)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| record_from_row(r, self.family))
            .collect()
    }

    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(RecordId::as_uuid).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO {archive} ({RECORD_COLUMNS}, archived_at) \
             SELECT {RECORD_COLUMNS}, $2 FROM {live} WHERE id = ANY($1)",
            archive = self.archive_table,
            live = self.table,
        ))
        .bind(&ids)
        .bind(archived_at)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE id = ANY($1)", self.table))
            .bind(&ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(usize::try_from(deleted).unwrap_or(usize::MAX))
    }

    async fn get_archived(&self, id: RecordId) -> Result<Option<DurableRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE id = $1 ORDER BY archived_at DESC LIMIT 1",
            self.archive_table
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r, self.family)).transpose()
    }
}
