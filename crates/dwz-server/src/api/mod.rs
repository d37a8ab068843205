pub mod import;

use axum::{response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::import::ImportOrchestrator;

pub use import::import_routes;

/// Application router: health endpoints plus the import API under `/api/v1`
pub fn create_router(orchestrator: Arc<ImportOrchestrator>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", import_routes())
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "DWZ Import Server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}
