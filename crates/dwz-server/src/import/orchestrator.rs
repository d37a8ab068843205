//! Import run coordination
//!
//! `ImportOrchestrator` owns the pipeline stages and drives one run at a time:
//!
//! 1. load check (optional delay while the host is busy)
//! 2. remote listing and freshness check, ending in `skipped` when nothing changed
//! 3. download, extract and load, retried as a whole per the retry policy
//! 4. metadata persistence, cleanup and the terminal status
//!
//! Manual and scheduled triggers share one single-flight guard; a trigger that finds a
//! run in flight is rejected with `ImportError::AlreadyRunning`, never queued.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::config::ImportConfig;
use super::error::{ImportError, ImportResult};
use super::extract::{archive_output_dir, ArchiveExtractor};
use super::freshness::FreshnessChecker;
use super::load_check::{LoadCheck, LoadProbe, ProcLoadAverage};
use super::loader::{BulkDatabaseLoader, DatabaseAdmin, LoadProgress, MySqlAdmin};
use super::models::{
    FileDescriptor, FilesInfo, ImportMetadataRecord, ImportState, ImportStatus, LogEntry,
    TriggerSource,
};
use super::remote::{connector_for, DownloadProgress, RemoteConnector, RemoteFileFetcher};
use super::schedule::ImportSchedule;
use super::status::StatusTracker;

/// Progress checkpoints of a run, in percent
mod progress {
    pub const LOAD_CHECK: u8 = 2;
    pub const LISTING: u8 = 5;
    pub const FRESHNESS: u8 = 10;
    pub const DOWNLOAD_START: u8 = 15;
    pub const DOWNLOAD_END: u8 = 40;
    pub const EXTRACT: u8 = 45;
    pub const LOAD_START: u8 = 60;
    pub const LOAD_END: u8 = 95;
    pub const METADATA: u8 = 97;
}

const DATABASE_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// How a single attempt ended when it did not fail
#[derive(Debug)]
enum AttemptOutcome {
    Imported(Vec<FileDescriptor>),
    Skipped(String),
}

/// Holds the single-flight slot for one run
///
/// Releasing the slot while the tracker still reports `running` means the run ended
/// without a terminal transition (panic or early return); the run is marked failed so
/// the status never claims a run that no longer exists.
struct RunGuard {
    running: Arc<AtomicBool>,
    status: Arc<StatusTracker>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.status.is_running() {
            let step = self.status.get_status().current_step;
            self.status
                .log_error(&step, "Import run ended without reaching a final state");
            self.status.mark_failed("import run aborted unexpectedly", &step);
        }
        self.running.store(false, Ordering::Release);
    }
}

struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Builder for injecting transport, database and load probe implementations
pub struct ImportOrchestratorBuilder {
    config: ImportConfig,
    status: Option<Arc<StatusTracker>>,
    connector: Option<Arc<dyn RemoteConnector>>,
    admin: Option<Arc<dyn DatabaseAdmin>>,
    probe: Option<Arc<dyn LoadProbe>>,
}

impl ImportOrchestratorBuilder {
    pub fn status_tracker(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn database_admin(mut self, admin: Arc<dyn DatabaseAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn load_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration and assemble the pipeline
    pub fn build(self) -> ImportResult<Arc<ImportOrchestrator>> {
        let config = self.config;
        config.validate()?;

        let schedule = if config.schedule.enabled {
            Some(ImportSchedule::parse(&config.schedule.expression)?)
        } else {
            None
        };

        let status = self
            .status
            .unwrap_or_else(|| Arc::new(StatusTracker::new(config.status.log_capacity)));
        let connector = self
            .connector
            .unwrap_or_else(|| connector_for(config.remote.protocol));
        let admin = match self.admin {
            Some(admin) => admin,
            None => Arc::new(MySqlAdmin::connect_lazy(
                &config.databases.url,
                std::time::Duration::from_secs(DATABASE_ACQUIRE_TIMEOUT_SECS),
            )?),
        };
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcLoadAverage::default()));

        let orchestrator = ImportOrchestrator {
            freshness: FreshnessChecker::new(config.freshness.clone()),
            fetcher: RemoteFileFetcher::new(
                config.remote.clone(),
                config.databases.targets.clone(),
                connector,
            ),
            extractor: ArchiveExtractor::new(config.archive.clone()),
            loader: BulkDatabaseLoader::new(config.databases.clone(), admin),
            load_check: LoadCheck::new(config.load_check.clone(), probe),
            schedule,
            status,
            running: Arc::new(AtomicBool::new(false)),
            scheduler: Mutex::new(None),
            config,
        };
        orchestrator.refresh_next_scheduled();

        Ok(Arc::new(orchestrator))
    }
}

/// Coordinates import runs and the schedule that triggers them
pub struct ImportOrchestrator {
    config: ImportConfig,
    status: Arc<StatusTracker>,
    freshness: FreshnessChecker,
    fetcher: RemoteFileFetcher,
    extractor: ArchiveExtractor,
    loader: BulkDatabaseLoader,
    load_check: LoadCheck,
    schedule: Option<ImportSchedule>,
    running: Arc<AtomicBool>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl ImportOrchestrator {
    /// Orchestrator with the production transport, MySQL admin and `/proc/loadavg` probe
    pub fn new(config: ImportConfig) -> ImportResult<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn builder(config: ImportConfig) -> ImportOrchestratorBuilder {
        ImportOrchestratorBuilder {
            config,
            status: None,
            connector: None,
            admin: None,
            probe: None,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn status_tracker(&self) -> Arc<StatusTracker> {
        self.status.clone()
    }

    pub fn get_status(&self) -> ImportStatus {
        self.status.get_status()
    }

    pub fn get_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.status.get_logs(limit)
    }

    /// Last successful import on record
    pub fn last_import(&self) -> Option<ImportMetadataRecord> {
        self.freshness.get_last_import_info()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start a manual run in the background and return its run id
    pub fn trigger_manual_import(self: &Arc<Self>) -> ImportResult<Uuid> {
        self.spawn_run(TriggerSource::Manual)
    }

    /// Run an import to completion on the current task
    ///
    /// Returns the terminal state, or `AlreadyRunning` if another run holds the slot.
    pub async fn run_import(&self, trigger: TriggerSource) -> ImportResult<ImportState> {
        let guard = self.try_acquire()?;
        let run_id = self.status.begin_run(trigger);
        Ok(self.execute(guard, run_id, trigger).await)
    }

    fn spawn_run(self: &Arc<Self>, trigger: TriggerSource) -> ImportResult<Uuid> {
        let guard = self.try_acquire()?;
        let run_id = self.status.begin_run(trigger);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(guard, run_id, trigger).await;
        });
        Ok(run_id)
    }

    fn try_acquire(&self) -> ImportResult<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                warn!("Import trigger rejected, a run is already in progress");
                ImportError::AlreadyRunning
            })?;
        Ok(RunGuard {
            running: self.running.clone(),
            status: self.status.clone(),
        })
    }

    #[instrument(skip_all, fields(run_id = %run_id, trigger = ?trigger))]
    async fn execute(&self, guard: RunGuard, run_id: Uuid, trigger: TriggerSource) -> ImportState {
        let status = &self.status;
        let max_retries = self.config.retry.max_attempts.saturating_sub(1);
        status.set_retry_info(0, max_retries);
        status.log_info("starting", format!("Import run {} started ({:?} trigger)", run_id, trigger));

        status.set_progress("load_check", progress::LOAD_CHECK);
        let delays = self
            .load_check
            .wait_for_capacity(|n, load| {
                status.log_warning(
                    "load_check",
                    format!(
                        "System load {:.2} above {:.2}, delaying start by {}s ({}/{})",
                        load,
                        self.config.load_check.threshold,
                        self.config.load_check.delay_secs,
                        n,
                        self.config.load_check.max_delays
                    ),
                );
            })
            .await;
        if delays > 0 {
            status.log_info("load_check", format!("Proceeding after {} delay(s)", delays));
        }

        let state = match self.run_with_retry().await {
            Ok(AttemptOutcome::Imported(files)) => {
                status.log_info(
                    "completed",
                    format!("Import finished, {} file(s) imported", files.len()),
                );
                status.mark_success();
                if self.config.storage.cleanup_on_success {
                    self.cleanup_workdirs().await;
                }
                ImportState::Success
            },
            Ok(AttemptOutcome::Skipped(reason)) => {
                status.log_info("freshness_check", format!("Import skipped: {}", reason));
                status.mark_skipped(&reason, "freshness_check");
                ImportState::Skipped
            },
            Err((err, step)) => {
                status.mark_failed(&err.to_string(), &step);
                if !self.config.storage.keep_on_failure {
                    self.cleanup_workdirs().await;
                }
                ImportState::Failed
            },
        };

        self.refresh_next_scheduled();
        drop(guard);
        info!(state = state.as_str(), "Import run finished");
        state
    }

    /// Attempt loop; a failed attempt reports the step it failed in
    async fn run_with_retry(&self) -> Result<AttemptOutcome, (ImportError, String)> {
        let retry = &self.config.retry;
        let max_retries = retry.max_attempts.saturating_sub(1);
        let mut attempt: u32 = 1;

        loop {
            self.status.set_retry_info(attempt - 1, max_retries);

            let err = match self.run_attempt().await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };

            let step = self.status.get_status().current_step;
            self.status.log_error_detail(
                &step,
                &format!("Attempt {}/{} failed", attempt, retry.max_attempts),
                &err,
            );

            if err.is_fatal() || (retry.fail_fast && !err.is_transient()) {
                self.status
                    .log_error(&step, "Error is not retryable, giving up");
                return Err((err, step));
            }
            if attempt >= retry.max_attempts {
                self.status.log_error(
                    &step,
                    format!("Giving up after {} attempt(s)", retry.max_attempts),
                );
                return Err((err, step));
            }

            self.status.log_warning(
                &step,
                format!(
                    "Retrying in {}s (attempt {}/{})",
                    retry.delay_secs,
                    attempt + 1,
                    retry.max_attempts
                ),
            );
            tokio::time::sleep(retry.delay()).await;
            attempt += 1;
        }
    }

    async fn run_attempt(&self) -> ImportResult<AttemptOutcome> {
        let status = &self.status;

        status.set_progress("listing", progress::LISTING);
        let remote_files = self.fetcher.list_files().await?;
        status.log_info(
            "listing",
            format!("Found {} matching remote file(s)", remote_files.len()),
        );

        status.set_progress("freshness_check", progress::FRESHNESS);
        let verdict = self.freshness.check_freshness(&remote_files);
        for comparison in verdict.comparisons.iter().filter(|c| c.is_newer) {
            let reasons: Vec<&str> = comparison.reasons.iter().map(|r| r.as_str()).collect();
            status.log_info(
                "freshness_check",
                format!("{} is newer: {}", comparison.remote.filename, reasons.join(", ")),
            );
        }
        status.set_files_info(FilesInfo {
            remote_files: if verdict.comparisons.is_empty() {
                remote_files.clone()
            } else {
                verdict.comparisons.iter().map(|c| c.remote.clone()).collect()
            },
            freshness_reason: Some(verdict.reason),
            last_import_at: self.freshness.get_last_import_info().map(|r| r.timestamp),
        });

        if !verdict.should_import {
            return Ok(AttemptOutcome::Skipped(verdict.reason.as_str().to_string()));
        }
        status.log_info(
            "freshness_check",
            format!("Import required: {}", verdict.reason.as_str()),
        );

        let download_dir = self.config.storage.download_dir();
        let extract_dir = self.config.storage.extract_dir();
        prepare_workdir(&download_dir).await?;
        prepare_workdir(&extract_dir).await?;

        status.set_progress("download", progress::DOWNLOAD_START);
        let downloaded = self
            .fetcher
            .download_files(&remote_files, &download_dir, Some(self.download_progress(&remote_files)))
            .await?;
        status.log_info("download", format!("Downloaded {} file(s)", downloaded.len()));

        status.set_progress("extract", progress::EXTRACT);
        let extracted = self
            .extractor
            .extract_all(&downloaded, &download_dir, &extract_dir)
            .await?;
        status.log_info("extract", format!("Extracted {} archive(s)", extracted.len()));

        status.set_progress("load", progress::LOAD_START);
        let report = self
            .loader
            .load_all(&extract_dir, &|p: LoadProgress<'_>| {
                status.set_progress("load", scale(progress::LOAD_START, progress::LOAD_END, p.fraction()));
                status.log_debug(
                    "load",
                    format!("{} ({}/{}): {}", p.database, p.index + 1, p.total, p.step.as_str()),
                );
            })
            .await?;
        for (database, reason) in &report.failed {
            status.log_warning("load", format!("Database {} was not loaded: {}", database, reason));
        }
        status.log_info("load", format!("Loaded {} database(s)", report.loaded.len()));

        // Only archives whose script was loaded count as imported; the rest are retried.
        let imported: Vec<FileDescriptor> = extracted
            .into_iter()
            .filter(|f| {
                let output = archive_output_dir(&extract_dir, &f.filename);
                report.sources.iter().any(|(_, script)| script.starts_with(&output))
                    || (f.database.is_empty() && report.failed.is_empty())
            })
            .map(FileDescriptor::mark_imported)
            .collect();

        status.set_progress("metadata", progress::METADATA);
        self.freshness.save_import_metadata(&imported)?;

        Ok(AttemptOutcome::Imported(imported))
    }

    fn download_progress(&self, files: &[FileDescriptor]) -> DownloadProgress {
        let status = self.status.clone();
        let names: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
        Arc::new(move |filename: &str, percent: u8| {
            let index = names.iter().position(|n| n == filename).unwrap_or(0);
            let done = (index as f64 + f64::from(percent) / 100.0) / names.len().max(1) as f64;
            status.set_progress(
                "download",
                scale(progress::DOWNLOAD_START, progress::DOWNLOAD_END, done),
            );
            status.log_debug("download", format!("{}: {}%", filename, percent));
        })
    }

    async fn cleanup_workdirs(&self) {
        for dir in [self.config.storage.download_dir(), self.config.storage.extract_dir()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to clean up working directory")
                },
            }
        }
    }

    fn refresh_next_scheduled(&self) {
        if let Some(schedule) = &self.schedule {
            self.status.set_next_scheduled(schedule.next_after(Utc::now()));
        }
    }

    /// Start the schedule loop; a no-op when scheduling is disabled or already started
    pub fn start(self: &Arc<Self>) {
        let Some(schedule) = self.schedule.clone() else {
            info!("Scheduled imports are disabled");
            return;
        };

        let mut slot = self.scheduler.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let task = tokio::spawn(this.schedule_loop(schedule, token.clone()));
        *slot = Some(SchedulerHandle { token, task });
        info!(schedule = %self.config.schedule.expression, "Import scheduler started");
    }

    /// Stop the schedule loop; an in-flight run is left to finish on its own
    pub async fn stop(&self) {
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                error!(error = %e, "Import scheduler task failed");
            }
            info!("Import scheduler stopped");
        }
    }

    async fn schedule_loop(self: Arc<Self>, schedule: ImportSchedule, token: CancellationToken) {
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(now) else {
                warn!(schedule = %schedule.expression(), "Schedule has no upcoming fire time");
                self.status.set_next_scheduled(None);
                return;
            };
            self.status.set_next_scheduled(Some(next));

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {},
            }

            match self.spawn_run(TriggerSource::Scheduled) {
                Ok(run_id) => info!(run_id = %run_id, "Scheduled import started"),
                Err(ImportError::AlreadyRunning) => {
                    self.status.log_warning(
                        "scheduler",
                        "Scheduled import skipped, a run is already in progress",
                    );
                },
                Err(e) => error!(error = %e, "Failed to start scheduled import"),
            }
        }
    }
}

fn scale(start: u8, end: u8, fraction: f64) -> u8 {
    let span = f64::from(end.saturating_sub(start));
    start.saturating_add((span * fraction.clamp(0.0, 1.0)).round() as u8)
}

// Stale files from a retained failed run must not leak into a new attempt.
async fn prepare_workdir(dir: &Path) -> ImportResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale() {
        assert_eq!(scale(60, 95, 0.0), 60);
        assert_eq!(scale(60, 95, 1.0), 95);
        assert_eq!(scale(15, 40, 0.5), 28);
        assert_eq!(scale(15, 40, 7.0), 40);
    }

    #[test]
    fn test_guard_release_marks_abandoned_run_failed() {
        let status = Arc::new(StatusTracker::default());
        let running = Arc::new(AtomicBool::new(true));
        status.begin_run(TriggerSource::Manual);
        status.set_progress("download", 20);

        drop(RunGuard {
            running: running.clone(),
            status: status.clone(),
        });

        let snapshot = status.get_status();
        assert_eq!(snapshot.status, ImportState::Failed);
        assert_eq!(snapshot.current_step, "download");
        assert!(snapshot.error.is_some());
        assert!(!running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_prepare_workdir_clears_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("downloads");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("stale.zip"), b"old").unwrap();

        prepare_workdir(&work).await.unwrap();
        assert!(work.exists());
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }
}
