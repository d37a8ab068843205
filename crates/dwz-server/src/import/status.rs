//! Run status and log store
//!
//! One `StatusTracker` exists per process. The orchestrator is its only writer; the
//! status API reads it concurrently. All state sits behind a single `RwLock`, so every
//! mutation is applied atomically and readers always get a consistent clone.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{FilesInfo, ImportState, ImportStatus, LogEntry, LogLevel, TriggerSource};

/// Default number of log entries kept in memory
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

const MAX_RUNNING_PROGRESS: u8 = 99;

#[derive(Debug, Default)]
struct TrackerState {
    status: ImportStatus,
    logs: VecDeque<LogEntry>,
}

/// Concurrency-safe store for the current run's state and its recent log lines
#[derive(Debug)]
pub struct StatusTracker {
    state: RwLock<TrackerState>,
    log_capacity: usize,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl StatusTracker {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                status: ImportStatus::default(),
                logs: VecDeque::with_capacity(log_capacity.min(DEFAULT_LOG_CAPACITY)),
            }),
            log_capacity,
        }
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    // Writers never panic mid-update, so a poisoned lock still holds consistent state.
    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transition state and step
    ///
    /// Entering `running` from any other state starts a new run: `started_at` is set,
    /// and the previous run's completion time, error, skip reason and retry count are
    /// cleared. Terminal states are routed through the matching `mark_*` semantics so
    /// the progress/status invariant always holds.
    pub fn update_status(&self, state: ImportState, step: &str, progress: u8) {
        let mut guard = self.write();
        let status = &mut guard.status;
        let now = Utc::now();

        match state {
            ImportState::Running => {
                if status.status != ImportState::Running {
                    start_run(status, now);
                }
                status.progress = progress.min(MAX_RUNNING_PROGRESS);
            },
            ImportState::Idle => {
                status.progress = 0;
                status.completed_at = None;
            },
            ImportState::Success | ImportState::Skipped => {
                status.progress = 100;
                status.completed_at = Some(now);
                if state == ImportState::Success {
                    status.last_success = Some(now);
                    status.error = None;
                }
            },
            ImportState::Failed => {
                status.progress = status.progress.min(MAX_RUNNING_PROGRESS);
                status.completed_at = Some(now);
                if status.error.is_none() {
                    status.error = Some(format!("import failed during {}", step));
                }
            },
        }

        status.status = state;
        status.current_step = step.to_string();
    }

    /// Start a new run and tag it with its trigger; returns the run id
    pub fn begin_run(&self, trigger: TriggerSource) -> Uuid {
        let mut guard = self.write();
        let status = &mut guard.status;
        start_run(status, Utc::now());
        status.status = ImportState::Running;
        status.current_step = "starting".to_string();
        status.progress = 0;
        status.trigger = Some(trigger);
        status.files_info = None;
        status.run_id.unwrap_or_default()
    }

    /// Move the run forward without changing state
    pub fn set_progress(&self, step: &str, progress: u8) {
        let mut guard = self.write();
        let status = &mut guard.status;
        if status.status == ImportState::Running {
            status.current_step = step.to_string();
            status.progress = progress.min(MAX_RUNNING_PROGRESS);
        }
    }

    pub fn mark_success(&self) {
        let mut guard = self.write();
        let status = &mut guard.status;
        let now = Utc::now();
        status.status = ImportState::Success;
        status.progress = 100;
        status.current_step = "completed".to_string();
        status.completed_at = Some(now);
        status.last_success = Some(now);
        status.error = None;
    }

    pub fn mark_failed(&self, err: &str, step: &str) {
        let mut guard = self.write();
        let status = &mut guard.status;
        status.status = ImportState::Failed;
        status.progress = status.progress.min(MAX_RUNNING_PROGRESS);
        status.current_step = step.to_string();
        status.completed_at = Some(Utc::now());
        status.error = Some(if err.is_empty() {
            "import failed".to_string()
        } else {
            err.to_string()
        });
    }

    pub fn mark_skipped(&self, reason: &str, step: &str) {
        let mut guard = self.write();
        let status = &mut guard.status;
        status.status = ImportState::Skipped;
        status.progress = 100;
        status.current_step = step.to_string();
        status.completed_at = Some(Utc::now());
        status.skip_reason = Some(reason.to_string());
        status.error = None;
    }

    /// Record retry bookkeeping; `current` is clamped to `max`
    pub fn set_retry_info(&self, current: u32, max: u32) {
        let mut guard = self.write();
        guard.status.max_retries = max;
        guard.status.retry_count = current.min(max);
    }

    pub fn set_next_scheduled(&self, next: Option<DateTime<Utc>>) {
        self.write().status.next_scheduled = next;
    }

    pub fn set_files_info(&self, info: FilesInfo) {
        self.write().status.files_info = Some(info);
    }

    pub fn log_debug(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        debug!(step = %step, "{}", message);
        self.push_log(LogLevel::Debug, step, message);
    }

    pub fn log_info(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        info!(step = %step, "{}", message);
        self.push_log(LogLevel::Info, step, message);
    }

    pub fn log_warning(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(step = %step, "{}", message);
        self.push_log(LogLevel::Warn, step, message);
    }

    pub fn log_error(&self, step: &str, message: impl Into<String>) {
        let message = message.into();
        error!(step = %step, "{}", message);
        self.push_log(LogLevel::Error, step, message);
    }

    /// Log an error line with the underlying cause appended
    pub fn log_error_detail(&self, step: &str, message: &str, detail: &dyn Display) {
        self.log_error(step, format!("{}: {}", message, detail));
    }

    fn push_log(&self, level: LogLevel, step: &str, message: String) {
        if self.log_capacity == 0 {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            step: step.to_string(),
            message,
        };

        let mut guard = self.write();
        while guard.logs.len() >= self.log_capacity {
            guard.logs.pop_front();
        }
        guard.logs.push_back(entry);
    }

    /// Consistent snapshot of the run status
    pub fn get_status(&self) -> ImportStatus {
        self.read().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.read().status.status == ImportState::Running
    }

    /// Up to `limit` most recent log entries, oldest first; `0` returns everything
    pub fn get_logs(&self, limit: usize) -> Vec<LogEntry> {
        let guard = self.read();
        let len = guard.logs.len();
        let take = if limit == 0 { len } else { limit.min(len) };
        guard.logs.iter().skip(len - take).cloned().collect()
    }

    /// Back to idle with an empty log buffer; `next_scheduled` survives
    pub fn reset(&self) {
        let mut guard = self.write();
        let next_scheduled = guard.status.next_scheduled;
        guard.status = ImportStatus {
            next_scheduled,
            ..ImportStatus::default()
        };
        guard.logs.clear();
    }
}

fn start_run(status: &mut ImportStatus, now: DateTime<Utc>) {
    status.run_id = Some(Uuid::new_v4());
    status.started_at = Some(now);
    status.completed_at = None;
    status.error = None;
    status.skip_reason = None;
    status.retry_count = 0;
}
