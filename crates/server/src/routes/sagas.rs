//! Saga lookup endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use record::{RecordState, SagaRecord, SagaStep};
use serde::Serialize;

use crate::error::ApiError;
use crate::runtime::Runtime;

#[derive(Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub uuid: String,
    pub saga_type: String,
    pub state: RecordState,
    pub tried_times: u32,
    pub try_times: u32,
    pub next_try_time: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Most recent context, or the initial one if no step has run.
    pub context: serde_json::Value,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub code: i32,
    pub name: String,
    pub state: RecordState,
    pub tried_times: u32,
    pub last_error: Option<String>,
}

impl From<&SagaStep> for StepResponse {
    fn from(step: &SagaStep) -> Self {
        Self {
            code: step.code,
            name: step.name.clone(),
            state: step.state(),
            tried_times: step.lifecycle.tried_times,
            last_error: step.lifecycle.last_error.clone(),
        }
    }
}

impl From<SagaRecord> for SagaResponse {
    fn from(saga: SagaRecord) -> Self {
        let steps = saga.steps.iter().map(StepResponse::from).collect();
        let record = saga.record;
        let state = record.state();
        let context = record.result.unwrap_or(record.payload).data;
        Self {
            id: record.id.to_string(),
            uuid: record.uuid.unwrap_or_default(),
            saga_type: record.kind,
            state,
            tried_times: record.lifecycle.tried_times,
            try_times: record.lifecycle.try_times,
            next_try_time: record.lifecycle.next_try_time,
            expire_at: record.lifecycle.expire_at,
            last_error: record.lifecycle.last_error,
            context,
            steps,
        }
    }
}

/// GET /sagas/{saga_type}/{uuid}: a saga and the progress of its steps.
#[tracing::instrument(skip(runtime))]
pub async fn get(
    State(runtime): State<Arc<Runtime>>,
    Path((saga_type, uuid)): Path<(String, String)>,
) -> Result<Json<SagaResponse>, ApiError> {
    let saga = runtime
        .sagas
        .find_by_uuid(&saga_type, &uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga not found: {saga_type}/{uuid}")))?;
    Ok(Json(saga.into()))
}
