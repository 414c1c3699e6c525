//! HTTP surface of the server.
//!
//! Every route requires an `x-user-id` header; validation failures map to
//! 400, a concurrent scan to 409, unknown tasks to 404. Everything that
//! happens after a scan is accepted is reported on the event stream.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use eidolon_core::error::{ScanError, ValidationError};

use crate::state::AppState;
use crate::store::StoreError;

pub mod collector;
pub mod tasks;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/collector/scan", post(collector::trigger_scan))
        .route("/collector/scan/cancel", post(collector::cancel_scan))
        .route("/collector/scan/history", get(collector::scan_history))
        .route(
            "/collector/config",
            get(collector::get_config).put(collector::put_config),
        )
        .route("/tasks/stream", get(tasks::task_stream))
        .with_state(state)
}

/// Identity of the calling user, taken from the `x-user-id` header.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "MissingUserId",
                    "x-user-id header is required",
                )
            })
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub detail: String,
}

/// HTTP error with a machine-readable kind.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            error,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.error.to_string(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.kind(), err.to_string())
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match &err {
            ScanError::AlreadyRunning { .. } => {
                Self::new(StatusCode::CONFLICT, "ScanAlreadyRunning", err.to_string())
            }
            ScanError::TaskNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "TaskNotFound", err.to_string())
            }
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ScanError",
                err.to_string(),
            ),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "StoreError",
            err.to_string(),
        )
    }
}
