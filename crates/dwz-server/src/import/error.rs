//! Import pipeline error types
//!
//! Every stage reports a typed error so the orchestrator can decide between retrying
//! and giving up without string matching.

use std::fmt;
use thiserror::Error;

/// Result type alias for import operations
pub type ImportResult<T> = std::result::Result<T, ImportError>;

/// Why a remote session could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Refused,
    Authentication,
    Timeout,
    Other,
}

/// Why an archive could not be turned into SQL files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailure {
    InvalidPassword,
    Timeout,
    EmptyArchive,
    NoSqlContent,
    Corrupt,
}

/// Which step of loading a target database failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    MissingFile,
    AmbiguousFile,
    Drop,
    Create,
    Import,
    Timeout,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionFailure::Refused => "connection refused",
            ConnectionFailure::Authentication => "authentication failed",
            ConnectionFailure::Timeout => "timed out",
            ConnectionFailure::Other => "connection error",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionFailure::InvalidPassword => "invalid password",
            ExtractionFailure::Timeout => "timed out",
            ExtractionFailure::EmptyArchive => "archive is empty",
            ExtractionFailure::NoSqlContent => "no SQL statements found",
            ExtractionFailure::Corrupt => "archive is corrupt",
        };
        f.write_str(s)
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadFailure::MissingFile => "no extracted file matches",
            LoadFailure::AmbiguousFile => "several extracted files match",
            LoadFailure::Drop => "drop failed",
            LoadFailure::Create => "create failed",
            LoadFailure::Import => "import failed",
            LoadFailure::Timeout => "import timed out",
        };
        f.write_str(s)
    }
}

/// Errors produced by the import pipeline
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("An import is already running")]
    AlreadyRunning,

    #[error("Connection to {host} failed ({kind}): {message}")]
    Connection {
        host: String,
        kind: ConnectionFailure,
        message: String,
    },

    #[error("Failed to read remote directory {path}: {message}")]
    DirectoryRead { path: String, message: String },

    #[error("No remote files in {path} match any of {patterns:?}")]
    NoMatchingFiles { path: String, patterns: Vec<String> },

    #[error("Transfer of {file} failed: {message}")]
    Transfer { file: String, message: String },

    #[error("Extraction of {archive} failed ({kind}): {message}")]
    Extraction {
        archive: String,
        kind: ExtractionFailure,
        message: String,
    },

    #[error("Loading database {database} failed ({kind}): {message}")]
    Load {
        database: String,
        kind: LoadFailure,
        message: String,
    },

    #[error("Import metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ImportError {
    pub fn extraction(
        archive: impl Into<String>,
        kind: ExtractionFailure,
        message: impl Into<String>,
    ) -> Self {
        ImportError::Extraction {
            archive: archive.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn load(database: impl Into<String>, kind: LoadFailure, message: impl Into<String>) -> Self {
        ImportError::Load {
            database: database.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed
    ///
    /// With fail-fast enabled, non-transient errors end the retry loop immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ImportError::Config(_) | ImportError::AlreadyRunning => false,
            ImportError::Connection { kind, .. } => {
                matches!(kind, ConnectionFailure::Timeout | ConnectionFailure::Other)
            },
            ImportError::Extraction { kind, .. } => {
                matches!(kind, ExtractionFailure::Timeout | ExtractionFailure::Corrupt)
            },
            ImportError::Load { kind, .. } => !matches!(
                kind,
                LoadFailure::MissingFile | LoadFailure::AmbiguousFile
            ),
            ImportError::NoMatchingFiles { .. }
            | ImportError::DirectoryRead { .. }
            | ImportError::Transfer { .. }
            | ImportError::Metadata(_)
            | ImportError::Io(_)
            | ImportError::TaskFailed(_) => true,
        }
    }

    /// Configuration errors are never retried, fail-fast or not
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::Config(_))
    }
}

impl From<tokio::task::JoinError> for ImportError {
    fn from(err: tokio::task::JoinError) -> Self {
        ImportError::TaskFailed(err.to_string())
    }
}

impl From<dwz_common::DwzError> for ImportError {
    fn from(err: dwz_common::DwzError) -> Self {
        match err {
            dwz_common::DwzError::Io(e) => ImportError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_is_not_transient() {
        let err = ImportError::Connection {
            host: "dump.example.org".to_string(),
            kind: ConnectionFailure::Refused,
            message: "os error 111".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_timeouts_are_transient() {
        let err = ImportError::extraction("mvdsb.zip", ExtractionFailure::Timeout, "60s elapsed");
        assert!(err.is_transient());

        let err = ImportError::load("mvdsb", LoadFailure::Timeout, "600s elapsed");
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_error_is_fatal() {
        let err = ImportError::Config("no target databases".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = ImportError::load("mvdsb", LoadFailure::MissingFile, "pattern mvdsb*.sql");
        let message = err.to_string();
        assert!(message.contains("mvdsb"));
        assert!(message.contains("no extracted file matches"));
    }
}
