//! Collector endpoints: scan lifecycle and per-user configuration.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use eidolon_core::config::ScanConfig;
use eidolon_core::event::TaskStatus;
use eidolon_core::plan::ScanPlan;

use crate::orchestrator::run_scan;
use crate::registry::{CancelOutcome, ScanRecord};
use crate::routes::{ApiError, UserId};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ScanStartResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct CancelScanRequest {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelScanResponse {
    pub status: CancelOutcome,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct ScanHistoryResponse {
    pub scans: Vec<ScanRecord>,
}

/// Start a scan from the caller's stored configuration.
pub async fn trigger_scan(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<ScanStartResponse>, ApiError> {
    let config = state
        .config_store
        .get(&user_id)
        .await?
        .unwrap_or_default()
        .normalize()?;
    let plan = ScanPlan::build(&config)?;

    let (task_id, cancel) = state.registry.start(&user_id, &config.summary())?;
    state.bus.open_topic(task_id);
    tokio::spawn(run_scan(state.runtime.clone(), task_id, cancel, plan));

    info!(%task_id, user_id, "scan accepted");
    Ok(Json(ScanStartResponse {
        task_id,
        status: TaskStatus::Running,
    }))
}

/// Request cancellation of a running scan.
pub async fn cancel_scan(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(request): Json<CancelScanRequest>,
) -> impl IntoResponse {
    let outcome = state.registry.cancel(request.task_id);
    info!(task_id = %request.task_id, user_id, ?outcome, "cancel requested");
    let status = match outcome {
        CancelOutcome::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    (status, Json(CancelScanResponse { status: outcome }))
}

/// Fetch the caller's scan configuration, falling back to defaults.
pub async fn get_config(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<ScanConfig>, ApiError> {
    let config = state.config_store.get(&user_id).await?.unwrap_or_default();
    Ok(Json(config))
}

/// Validate and store the caller's scan configuration.
pub async fn put_config(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(config): Json<ScanConfig>,
) -> Result<Json<ScanConfig>, ApiError> {
    let config = config.normalize()?;
    // Target parsing and overlap checks run now so a bad config never
    // reaches the store
    ScanPlan::build(&config)?;
    state.config_store.put(&user_id, &config).await?;
    info!(user_id, "scan config updated");
    Ok(Json(config))
}

/// Recent finished scans, newest first.
pub async fn scan_history(
    State(state): State<AppState>,
    UserId(_user_id): UserId,
    Query(query): Query<HistoryQuery>,
) -> Json<ScanHistoryResponse> {
    Json(ScanHistoryResponse {
        scans: state.registry.history(query.limit),
    })
}
