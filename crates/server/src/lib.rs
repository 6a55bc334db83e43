//! Service host for the reliability substrate.
//!
//! Assembles stores, the task and saga supervisors, the outbox publisher and
//! every periodic sweep into a [`Runtime`], and exposes a small ops surface
//! over HTTP: health, Prometheus metrics, task and saga lookup by idempotency
//! key, and manual sweep triggers.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{ApiError, StartupError};
pub use runtime::{Runtime, RuntimeBuilder, connect_stores};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(runtime: Arc<Runtime>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health))
        .route("/tasks/{uuid}", get(routes::tasks::get))
        .route("/sagas/{saga_type}/{uuid}", get(routes::sagas::get))
        .route("/sweeps", get(routes::sweeps::list))
        .route("/sweeps/{name}", post(routes::sweeps::trigger))
        .with_state(runtime)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
