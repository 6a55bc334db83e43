//! Liveness and Prometheus scrape endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::runtime::Runtime;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub workers_in_flight: usize,
    pub worker_pool_size: usize,
}

/// GET /health
pub async fn health(State(runtime): State<Arc<Runtime>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: runtime.service_name.clone(),
        workers_in_flight: runtime.pool.in_flight(),
        worker_pool_size: runtime.pool.size(),
    })
}

/// GET /metrics in the Prometheus text exposition format.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    let body = handle.render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
