//! Import routes
//!
//! A thin view over the orchestrator: status and log polling, the last recorded import,
//! and a manual trigger.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::AppError;
use crate::import::ImportOrchestrator;

/// Default number of log entries returned by `/import/logs`
pub const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// Create import routes
pub fn import_routes() -> Router<Arc<ImportOrchestrator>> {
    Router::new()
        .route("/import/status", get(get_status))
        .route("/import/logs", get(get_logs))
        .route("/import/last", get(get_last_import))
        .route("/import/trigger", post(trigger_import))
}

/// GET /import/status
async fn get_status(State(orchestrator): State<Arc<ImportOrchestrator>>) -> impl IntoResponse {
    Json(orchestrator.get_status())
}

/// GET /import/logs?limit=50
///
/// `limit=0` returns the whole buffer.
async fn get_logs(
    State(orchestrator): State<Arc<ImportOrchestrator>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let logs = orchestrator.get_logs(query.limit.unwrap_or(DEFAULT_LOG_LIMIT));
    Json(json!({ "count": logs.len(), "logs": logs }))
}

/// GET /import/last
async fn get_last_import(
    State(orchestrator): State<Arc<ImportOrchestrator>>,
) -> Result<Response, AppError> {
    match orchestrator.last_import() {
        Some(record) => Ok((StatusCode::OK, Json(record)).into_response()),
        None => Err(AppError::NotFound("no successful import on record".to_string())),
    }
}

/// POST /import/trigger
///
/// Answers `202 Accepted` with the run id, or `409 Conflict` while a run is in flight.
async fn trigger_import(
    State(orchestrator): State<Arc<ImportOrchestrator>>,
) -> Result<Response, AppError> {
    let run_id = orchestrator.trigger_manual_import()?;
    tracing::info!(run_id = %run_id, "Manual import triggered");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "status": "running" })),
    )
        .into_response())
}
