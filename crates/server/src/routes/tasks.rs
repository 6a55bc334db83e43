//! Task lookup endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use record::{DurableRecord, RecordState};
use serde::Serialize;

use crate::error::ApiError;
use crate::runtime::Runtime;

#[derive(Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub uuid: Option<String>,
    pub kind: String,
    pub state: RecordState,
    pub tried_times: u32,
    pub try_times: u32,
    pub next_try_time: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl From<DurableRecord> for TaskResponse {
    fn from(record: DurableRecord) -> Self {
        let state = record.state();
        Self {
            id: record.id.to_string(),
            uuid: record.uuid,
            kind: record.kind,
            state,
            tried_times: record.lifecycle.tried_times,
            try_times: record.lifecycle.try_times,
            next_try_time: record.lifecycle.next_try_time,
            expire_at: record.lifecycle.expire_at,
            last_error: record.lifecycle.last_error,
            result: record.result.map(|payload| payload.data),
        }
    }
}

/// GET /tasks/{uuid}: the live task submitted under an idempotency key.
#[tracing::instrument(skip(runtime))]
pub async fn get(
    State(runtime): State<Arc<Runtime>>,
    Path(uuid): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let record = runtime
        .tasks
        .query(&uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {uuid}")))?;
    Ok(Json(record.into()))
}
