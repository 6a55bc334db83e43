//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use record_store::StoreError;
use saga::SagaError;
use scheduler::SchedulerError;
use task::TaskError;
use thiserror::Error;

/// Errors raised while assembling the runtime at start-up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task registration failed: {0}")]
    Task(#[from] TaskError),

    #[error("Saga registration failed: {0}")]
    Saga(#[from] SagaError),
}

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    Task(TaskError),
    Saga(SagaError),
    Scheduler(SchedulerError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Task(err) => task_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Scheduler(err) => scheduler_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    if err.is_conflict() {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn task_error_to_response(err: TaskError) -> (StatusCode, String) {
    let status = match &err {
        TaskError::NotFound(_) | TaskError::UnknownKind(_) => StatusCode::NOT_FOUND,
        TaskError::Record(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TaskError::Store(store) => store_status(store),
        TaskError::DuplicateKind(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::NotFound(_) | SagaError::UnknownSagaType(_) => StatusCode::NOT_FOUND,
        SagaError::UnknownContext(_) | SagaError::AmbiguousContext(_) => StatusCode::BAD_REQUEST,
        SagaError::TypeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SagaError::Store(store) => store_status(store),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn scheduler_error_to_response(err: SchedulerError) -> (StatusCode, String) {
    match err {
        SchedulerError::UnknownJob(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SchedulerError::Saga(saga) => saga_error_to_response(saga),
        SchedulerError::Store(ref store) => (store_status(store), err.to_string()),
        SchedulerError::Record(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        ApiError::Task(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError::Scheduler(err)
    }
}
