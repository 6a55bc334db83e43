use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::RecordId;
use record::{DurableRecord, RecordFamily, SagaRecord, SagaStep, Version};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::rows::{
    RECORD_COLUMNS, STEP_COLUMNS, bind_query, bind_record, bind_step, map_duplicate,
    record_from_row, select_sql, step_from_row, to_db_count,
};
use crate::{RecordQuery, Result, SagaRepository, StoreError};

const SAGA_UNIQUE: &str = "uq_saga_service_kind_uuid";

/// PostgreSQL-backed saga repository.
///
/// The saga row lives in `saga`, its steps in `saga_step`. Every write touches
/// both inside one transaction.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_steps(
        tx: &mut Transaction<'_, Postgres>,
        saga_id: Uuid,
        steps: &[SagaStep],
    ) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO saga_step ({STEP_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (saga_id, code) DO UPDATE SET
                name = EXCLUDED.name,
                input_type = EXCLUDED.input_type,
                input = EXCLUDED.input,
                output_type = EXCLUDED.output_type,
                output = EXCLUDED.output,
                state = EXCLUDED.state,
                expire_at = EXCLUDED.expire_at,
                last_try_time = EXCLUDED.last_try_time,
                next_try_time = EXCLUDED.next_try_time,
                try_times = EXCLUDED.try_times,
                tried_times = EXCLUDED.tried_times,
                last_error = EXCLUDED.last_error
            "#
        );
        for step in steps {
            bind_step(sqlx::query(&sql), saga_id, step)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn load_steps(
        &self,
        table: &str,
        saga_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<SagaStep>>> {
        let mut by_saga: HashMap<Uuid, Vec<SagaStep>> = HashMap::new();
        if saga_ids.is_empty() {
            return Ok(by_saga);
        }

        let sql =
            format!("SELECT {STEP_COLUMNS} FROM {table} WHERE saga_id = ANY($1) ORDER BY code");
        let rows = sqlx::query(&sql)
            .bind(saga_ids)
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            let saga_id: Uuid = sqlx::Row::try_get(row, "saga_id")?;
            by_saga.entry(saga_id).or_default().push(step_from_row(row)?);
        }
        Ok(by_saga)
    }

    async fn assemble(
        &self,
        step_table: &str,
        records: Vec<DurableRecord>,
    ) -> Result<Vec<SagaRecord>> {
        let ids: Vec<Uuid> = records.iter().map(|r| r.id.as_uuid()).collect();
        let mut steps = self.load_steps(step_table, &ids).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let steps = steps.remove(&record.id.as_uuid()).unwrap_or_default();
                SagaRecord { record, steps }
            })
            .collect())
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    async fn insert(&self, saga: &SagaRecord) -> Result<SagaRecord> {
        let mut stored = saga.clone();
        stored.record.version = saga.record.version.next();

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO saga ({RECORD_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        bind_record(sqlx::query(&sql), &stored.record)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_duplicate(
                    e,
                    SAGA_UNIQUE,
                    &saga.record.service_name,
                    saga.record.uuid.as_deref(),
                )
            })?;

        Self::upsert_steps(&mut tx, saga.id().as_uuid(), &saga.steps).await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn update(&self, saga: &SagaRecord) -> Result<SagaRecord> {
        let record = &saga.record;
        let lc = &record.lifecycle;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE saga SET
                result_type = $3, result = $4, state = $5, expire_at = $6,
                last_try_time = $7, next_try_time = $8, try_times = $9,
                tried_times = $10, last_error = $11, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.version.as_i64())
        .bind(record.result.as_ref().map(|p| p.type_tag.clone()))
        .bind(record.result.as_ref().map(|p| p.data.clone()))
        .bind(lc.state.code())
        .bind(lc.expire_at)
        .bind(lc.last_try_time)
        .bind(lc.next_try_time)
        .bind(to_db_count(lc.try_times))
        .bind(to_db_count(lc.tried_times))
        .bind(lc.last_error.clone())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM saga WHERE id = $1")
                .bind(record.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match actual {
                Some(actual) => StoreError::Conflict {
                    id: record.id,
                    expected: record.version,
                    actual: Version::new(actual),
                },
                None => StoreError::NotFound(record.id),
            });
        }

        Self::upsert_steps(&mut tx, record.id.as_uuid(), &saga.steps).await?;
        tx.commit().await?;

        let mut stored = saga.clone();
        stored.record.version = record.version.next();
        Ok(stored)
    }

    async fn get(&self, id: RecordId) -> Result<Option<SagaRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM saga WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row, RecordFamily::Saga)?;
        Ok(self.assemble("saga_step", vec![record]).await?.pop())
    }

    async fn find_by_uuid(
        &self,
        service_name: &str,
        saga_type: &str,
        uuid: &str,
    ) -> Result<Option<SagaRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM saga WHERE service_name = $1 AND kind = $2 AND uuid = $3"
        );
        let row = sqlx::query(&sql)
            .bind(service_name)
            .bind(saga_type)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row, RecordFamily::Saga)?;
        Ok(self.assemble("saga_step", vec![record]).await?.pop())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<SagaRecord>> {
        let sql = select_sql("saga", query);
        let rows = bind_query(sqlx::query(&sql), query)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .iter()
            .map(|r| record_from_row(r, RecordFamily::Saga))
            .collect::<Result<Vec<_>>>()?;
        self.assemble("saga_step", records).await
    }

    async fn archive(&self, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(RecordId::as_uuid).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO archived_saga ({RECORD_COLUMNS}, archived_at) \
             SELECT {RECORD_COLUMNS}, $2 FROM saga WHERE id = ANY($1)"
        ))
        .bind(&ids)
        .bind(archived_at)
        .execute(&mut *tx)
        .await?;

        let steps = sqlx::query(&format!(
            "INSERT INTO archived_saga_step ({STEP_COLUMNS}, archived_at) \
             SELECT {STEP_COLUMNS}, $2 FROM saga_step WHERE saga_id = ANY($1)"
        ))
        .bind(&ids)
        .bind(archived_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Step rows go with the saga through ON DELETE CASCADE.
        let deleted = sqlx::query("DELETE FROM saga WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::debug!(sagas = deleted, steps, "Moved sagas to archive");
        Ok(usize::try_from(deleted).unwrap_or(usize::MAX))
    }

    async fn get_archived(&self, id: RecordId) -> Result<Option<SagaRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM archived_saga WHERE id = $1 \
             ORDER BY archived_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row, RecordFamily::Saga)?;
        Ok(self
            .assemble("archived_saga_step", vec![record])
            .await?
            .pop())
    }
}
