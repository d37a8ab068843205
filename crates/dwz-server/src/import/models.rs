//! Data model shared by the import stages and the status API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One dump file as it moves through the pipeline
///
/// Stages never mutate a recorded descriptor in place; they hand on a copy with the
/// relevant flag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Glob pattern the file matched when it was listed
    #[serde(default)]
    pub pattern: String,
    /// Target database; empty when none could be inferred
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub extracted: bool,
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub is_newer: bool,
}

impl FileDescriptor {
    pub fn new(filename: impl Into<String>, size: u64, mod_time: DateTime<Utc>) -> Self {
        Self {
            filename: filename.into(),
            size,
            mod_time,
            checksum: None,
            pattern: String::new(),
            database: String::new(),
            downloaded: false,
            extracted: false,
            imported: false,
            is_newer: false,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn mark_downloaded(mut self) -> Self {
        self.downloaded = true;
        self
    }

    pub fn mark_extracted(mut self) -> Self {
        self.extracted = true;
        self
    }

    pub fn mark_imported(mut self) -> Self {
        self.imported = true;
        self
    }

    pub fn mark_newer(mut self, is_newer: bool) -> Self {
        self.is_newer = is_newer;
        self
    }

    pub fn checksum_str(&self) -> &str {
        self.checksum.as_deref().unwrap_or("")
    }
}

/// Why the freshness check decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessReason {
    FirstImport,
    FreshnessCheckDisabled,
    NewerFilesAvailable,
    NoNewerFiles,
}

impl FreshnessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessReason::FirstImport => "first_import",
            FreshnessReason::FreshnessCheckDisabled => "freshness_check_disabled",
            FreshnessReason::NewerFilesAvailable => "newer_files_available",
            FreshnessReason::NoNewerFiles => "no_newer_files",
        }
    }
}

/// Why a single remote file counts as newer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeReason {
    FileNotFoundInLastImport,
    NewerTimestamp,
    DifferentSize,
    DifferentChecksum,
}

impl FileChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileChangeReason::FileNotFoundInLastImport => "file_not_found_in_last_import",
            FileChangeReason::NewerTimestamp => "newer_timestamp",
            FileChangeReason::DifferentSize => "different_size",
            FileChangeReason::DifferentChecksum => "different_checksum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComparison {
    pub remote: FileDescriptor,
    pub last: Option<FileDescriptor>,
    pub is_newer: bool,
    pub reasons: Vec<FileChangeReason>,
}

/// Outcome of a freshness check; recomputed on every run, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessVerdict {
    pub should_import: bool,
    pub reason: FreshnessReason,
    pub comparisons: Vec<FileComparison>,
}

/// The last successful import, the only state that survives restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadataRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub files: Vec<FileDescriptor>,
}

/// On-disk layout: `{"last_import": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadataDocument {
    pub last_import: ImportMetadataRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportState {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Skipped,
}

impl ImportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportState::Success | ImportState::Failed | ImportState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::Idle => "idle",
            ImportState::Running => "running",
            ImportState::Success => "success",
            ImportState::Failed => "failed",
            ImportState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

/// Files seen by the current run, embedded in the status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilesInfo {
    pub remote_files: Vec<FileDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness_reason: Option<FreshnessReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_at: Option<DateTime<Utc>>,
}

/// Snapshot of the current (or most recent) run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImportStatus {
    pub run_id: Option<Uuid>,
    pub status: ImportState,
    pub trigger: Option<TriggerSource>,
    pub progress: u8,
    pub current_step: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_scheduled: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub files_info: Option<FilesInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub step: String,
    pub message: String,
}
