//! HTTP-facing error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::import::ImportError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Import(ImportError::AlreadyRunning) => {
                (StatusCode::CONFLICT, ImportError::AlreadyRunning.to_string())
            },
            AppError::Import(ref e) => {
                tracing::error!("Import error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
