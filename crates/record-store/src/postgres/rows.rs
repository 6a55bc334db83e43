//! Row mapping and dynamic query building shared by the PostgreSQL stores.

use chrono::{DateTime, Utc};
use record::{
    DurableRecord, Lifecycle, Payload, RecordFamily, RecordState, SagaStep, Version,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::{RecordQuery, Result, StoreError};

pub(crate) const RECORD_COLUMNS: &str = "id, uuid, service_name, kind, payload_type, payload, \
     result_type, result, state, created_at, expire_at, last_try_time, next_try_time, \
     try_times, tried_times, last_error, version";

pub(crate) const STEP_COLUMNS: &str = "saga_id, code, name, input_type, input, output_type, \
     output, state, created_at, expire_at, last_try_time, next_try_time, try_times, \
     tried_times, last_error";

pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Live and archive table for a flat record family.
pub(crate) fn record_tables(family: RecordFamily) -> Result<(&'static str, &'static str)> {
    match family {
        RecordFamily::Task => Ok(("task_record", "archived_task_record")),
        RecordFamily::Event => Ok(("event_record", "archived_event_record")),
        other => Err(StoreError::InvalidTable(format!(
            "{other} records are not stored in a flat record table"
        ))),
    }
}

pub(crate) fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn payload_from_row(row: &PgRow, type_column: &str, data_column: &str) -> Result<Option<Payload>> {
    let type_tag: Option<String> = row.try_get(type_column)?;
    let data: Option<serde_json::Value> = row.try_get(data_column)?;
    Ok(type_tag.map(|tag| Payload::raw(tag, data.unwrap_or(serde_json::Value::Null))))
}

fn lifecycle_from_row(row: &PgRow, family: RecordFamily) -> Result<Lifecycle> {
    Ok(Lifecycle {
        family,
        state: RecordState::from_code(family, row.try_get("state")?)?,
        created_at: row.try_get("created_at")?,
        expire_at: row.try_get("expire_at")?,
        last_try_time: row.try_get::<Option<DateTime<Utc>>, _>("last_try_time")?,
        next_try_time: row.try_get("next_try_time")?,
        try_times: from_db_count(row.try_get("try_times")?),
        tried_times: from_db_count(row.try_get("tried_times")?),
        last_error: row.try_get("last_error")?,
    })
}

pub(crate) fn record_from_row(row: &PgRow, family: RecordFamily) -> Result<DurableRecord> {
    let payload = payload_from_row(row, "payload_type", "payload")?
        .ok_or_else(|| StoreError::InvalidTable("record row without payload".to_string()))?;

    Ok(DurableRecord {
        id: row.try_get::<Uuid, _>("id")?.into(),
        uuid: row.try_get("uuid")?,
        kind: row.try_get("kind")?,
        service_name: row.try_get("service_name")?,
        payload,
        result: payload_from_row(row, "result_type", "result")?,
        lifecycle: lifecycle_from_row(row, family)?,
        version: Version::new(row.try_get("version")?),
    })
}

pub(crate) fn step_from_row(row: &PgRow) -> Result<SagaStep> {
    Ok(SagaStep {
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        input: payload_from_row(row, "input_type", "input")?,
        output: payload_from_row(row, "output_type", "output")?,
        lifecycle: lifecycle_from_row(row, RecordFamily::SagaStep)?,
    })
}

/// Binds every record column in `RECORD_COLUMNS` order ($1..$17).
pub(crate) fn bind_record<'q>(query: PgQuery<'q>, record: &DurableRecord) -> PgQuery<'q> {
    let lc = &record.lifecycle;
    query
        .bind(record.id.as_uuid())
        .bind(record.uuid.clone())
        .bind(record.service_name.clone())
        .bind(record.kind.clone())
        .bind(record.payload.type_tag.clone())
        .bind(record.payload.data.clone())
        .bind(record.result.as_ref().map(|p| p.type_tag.clone()))
        .bind(record.result.as_ref().map(|p| p.data.clone()))
        .bind(lc.state.code())
        .bind(lc.created_at)
        .bind(lc.expire_at)
        .bind(lc.last_try_time)
        .bind(lc.next_try_time)
        .bind(to_db_count(lc.try_times))
        .bind(to_db_count(lc.tried_times))
        .bind(lc.last_error.clone())
        .bind(record.version.as_i64())
}

/// Binds every step column in `STEP_COLUMNS` order ($1..$15).
pub(crate) fn bind_step<'q>(query: PgQuery<'q>, saga_id: Uuid, step: &SagaStep) -> PgQuery<'q> {
    let lc = &step.lifecycle;
    query
        .bind(saga_id)
        .bind(step.code)
        .bind(step.name.clone())
        .bind(step.input.as_ref().map(|p| p.type_tag.clone()))
        .bind(step.input.as_ref().map(|p| p.data.clone()))
        .bind(step.output.as_ref().map(|p| p.type_tag.clone()))
        .bind(step.output.as_ref().map(|p| p.data.clone()))
        .bind(lc.state.code())
        .bind(lc.created_at)
        .bind(lc.expire_at)
        .bind(lc.last_try_time)
        .bind(lc.next_try_time)
        .bind(to_db_count(lc.try_times))
        .bind(to_db_count(lc.tried_times))
        .bind(lc.last_error.clone())
}

/// Builds `SELECT {columns} FROM {table} WHERE ...` for a record query.
pub(crate) fn select_sql(table: &str, query: &RecordQuery) -> String {
    let mut sql = format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE 1=1");
    let mut param_count = 0;

    if query.service_name.is_some() {
        param_count += 1;
        sql.push_str(&format!(" AND service_name = ${param_count}"));
    }
    if query.kinds.is_some() {
        param_count += 1;
        sql.push_str(&format!(" AND kind = ANY(${param_count})"));
    }
    if !query.states.is_empty() {
        param_count += 1;
        sql.push_str(&format!(" AND state = ANY(${param_count})"));
    }
    if query.due_before.is_some() {
        param_count += 1;
        sql.push_str(&format!(" AND next_try_time <= ${param_count}"));
    }
    if query.expired_before.is_some() {
        param_count += 1;
        sql.push_str(&format!(" AND expire_at < ${param_count}"));
    }
    if query.after.is_some() {
        sql.push_str(&format!(
            " AND (created_at, id) > (${}, ${})",
            param_count + 1,
            param_count + 2
        ));
        param_count += 2;
    }

    sql.push_str(" ORDER BY created_at ASC, id ASC");

    if query.limit.is_some() {
        param_count += 1;
        sql.push_str(&format!(" LIMIT ${param_count}"));
    }

    sql
}

/// Binds the parameters of [`select_sql`] in the same order.
pub(crate) fn bind_query<'q>(mut sqlx_query: PgQuery<'q>, query: &RecordQuery) -> PgQuery<'q> {
    if let Some(ref service) = query.service_name {
        sqlx_query = sqlx_query.bind(service.clone());
    }
    if let Some(ref kinds) = query.kinds {
        sqlx_query = sqlx_query.bind(kinds.clone());
    }
    if !query.states.is_empty() {
        let codes: Vec<i16> = query.states.iter().map(RecordState::code).collect();
        sqlx_query = sqlx_query.bind(codes);
    }
    if let Some(at) = query.due_before {
        sqlx_query = sqlx_query.bind(at);
    }
    if let Some(at) = query.expired_before {
        sqlx_query = sqlx_query.bind(at);
    }
    if let Some(cursor) = query.after {
        sqlx_query = sqlx_query
            .bind(cursor.created_at)
            .bind(cursor.id.as_uuid());
    }
    if let Some(limit) = query.limit {
        sqlx_query = sqlx_query.bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    sqlx_query
}

/// Maps a unique violation on `constraint` to `DuplicateKey`.
pub(crate) fn map_duplicate(
    err: sqlx::Error,
    constraint: &str,
    service_name: &str,
    uuid: Option<&str>,
) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.constraint() == Some(constraint)
    {
        return StoreError::DuplicateKey {
            service_name: service_name.to_string(),
            uuid: uuid.unwrap_or_default().to_string(),
        };
    }
    StoreError::Database(err)
}
