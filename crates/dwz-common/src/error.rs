//! Error types shared across the DWZ crates

use thiserror::Error;

/// Result type alias for shared helpers
pub type Result<T> = std::result::Result<T, DwzError>;

/// Errors raised by the shared helpers
#[derive(Error, Debug)]
pub enum DwzError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
