//! Manual trigger of periodic jobs.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use scheduler::SweepOutcome;
use serde::Serialize;

use crate::error::ApiError;
use crate::runtime::Runtime;

#[derive(Serialize)]
pub struct SweepResponse {
    pub sweep: String,
    pub outcome: &'static str,
    pub processed: usize,
}

#[derive(Serialize)]
pub struct SweepListResponse {
    pub sweeps: Vec<&'static str>,
}

/// GET /sweeps: names of the registered periodic jobs.
pub async fn list(State(runtime): State<Arc<Runtime>>) -> Json<SweepListResponse> {
    Json(SweepListResponse {
        sweeps: runtime.scheduler.job_names(),
    })
}

/// POST /sweeps/{name}: runs one tick of a periodic job now.
///
/// The tick takes the same lease as the timer, so it reports `contended` when
/// another instance is sweeping and `skipped` when this one already is.
#[tracing::instrument(skip(runtime))]
pub async fn trigger(
    State(runtime): State<Arc<Runtime>>,
    Path(name): Path<String>,
) -> Result<Json<SweepResponse>, ApiError> {
    let (outcome, processed) = match runtime.scheduler.trigger(&name).await? {
        SweepOutcome::Completed { processed } => ("completed", processed),
        SweepOutcome::Contended => ("contended", 0),
        SweepOutcome::Skipped => ("skipped", 0),
    };
    tracing::info!(sweep = %name, outcome, processed, "sweep triggered manually");
    Ok(Json(SweepResponse {
        sweep: name,
        outcome,
        processed,
    }))
}
