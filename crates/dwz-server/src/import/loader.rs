//! Bulk loading of extracted SQL dumps into their target databases
//!
//! Each configured target is rebuilt from scratch: drop, create, then run its dump
//! against the fresh database. Database DDL goes through the `DatabaseAdmin` trait so the
//! pipeline can run against an in-memory fake in tests.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Executor;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use super::config::{is_valid_database_name, DatabaseConfig, DatabaseTarget};
use super::error::{ImportError, ImportResult, LoadFailure};

/// DDL and script execution against the local database server
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    async fn drop_database(&self, name: &str) -> anyhow::Result<()>;

    async fn create_database(&self, name: &str) -> anyhow::Result<()>;

    /// Run every statement in `script` with `name` as the default database
    async fn import_file(&self, name: &str, script: &Path) -> anyhow::Result<()>;
}

/// `DatabaseAdmin` for a MySQL/MariaDB server
pub struct MySqlAdmin {
    pool: MySqlPool,
}

impl MySqlAdmin {
    /// Connects lazily; `url` points at the server, not at a database
    pub fn connect_lazy(url: &str, acquire_timeout: Duration) -> ImportResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| ImportError::Config(format!("invalid database url: {}", e)))?;
        Ok(Self { pool })
    }
}

// Names are validated as plain identifiers before they reach any DDL.
fn quoted(name: &str) -> anyhow::Result<String> {
    if !is_valid_database_name(name) {
        anyhow::bail!("refusing invalid database name {:?}", name);
    }
    Ok(format!("`{}`", name))
}

#[async_trait]
impl DatabaseAdmin for MySqlAdmin {
    async fn drop_database(&self, name: &str) -> anyhow::Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quoted(name)?);
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_database(&self, name: &str) -> anyhow::Result<()> {
        let sql = format!(
            "CREATE DATABASE {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
            quoted(name)?
        );
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn import_file(&self, name: &str, script: &Path) -> anyhow::Result<()> {
        let sql = tokio::fs::read_to_string(script).await?;
        let use_db = format!("USE {}", quoted(name)?);

        // USE only applies to the connection it ran on.
        let mut conn = self.pool.acquire().await?;
        conn.execute(sqlx::raw_sql(&use_db)).await?;
        conn.execute(sqlx::raw_sql(&sql)).await?;
        Ok(())
    }
}

/// Step within one database load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    Drop,
    Create,
    Import,
    Done,
}

impl LoadStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStep::Drop => "drop",
            LoadStep::Create => "create",
            LoadStep::Import => "import",
            LoadStep::Done => "done",
        }
    }

    fn weight(&self) -> f64 {
        match self {
            LoadStep::Drop => 0.0,
            LoadStep::Create => 0.1,
            LoadStep::Import => 0.2,
            LoadStep::Done => 1.0,
        }
    }
}

/// Progress of the load stage
#[derive(Debug, Clone, Copy)]
pub struct LoadProgress<'a> {
    pub database: &'a str,
    pub index: usize,
    pub total: usize,
    pub step: LoadStep,
}

impl LoadProgress<'_> {
    /// Completed share of the whole load stage, `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        ((self.index as f64 + self.step.weight()) / self.total as f64).min(1.0)
    }
}

/// Outcome of loading all targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Script imported into each loaded database
    pub sources: Vec<(String, PathBuf)>,
}

pub struct BulkDatabaseLoader {
    config: DatabaseConfig,
    admin: Arc<dyn DatabaseAdmin>,
}

impl BulkDatabaseLoader {
    pub fn new(config: DatabaseConfig, admin: Arc<dyn DatabaseAdmin>) -> Self {
        Self { config, admin }
    }

    /// Load every configured target from the files in `extract_dir`
    ///
    /// Without `best_effort` the first failing target ends the stage. With it, the
    /// remaining targets are still loaded and the stage fails only if none succeeded.
    #[instrument(skip(self, progress), fields(targets = self.config.targets.len()))]
    pub async fn load_all(
        &self,
        extract_dir: &Path,
        progress: &(dyn Fn(LoadProgress<'_>) + Send + Sync),
    ) -> ImportResult<LoadReport> {
        let extracted = list_extracted(extract_dir).await?;
        let assignments = assign_files(&self.config.targets, &extracted);
        let total = self.config.targets.len();

        let mut report = LoadReport::default();
        let mut first_error = None;

        for (index, (target, files)) in self.config.targets.iter().zip(assignments).enumerate() {
            let report_step = |step: LoadStep| {
                progress(LoadProgress {
                    database: &target.name,
                    index,
                    total,
                    step,
                })
            };

            let result = match single_file(target, &files) {
                Ok(file) => self
                    .load_database(&target.name, file, &report_step)
                    .await
                    .map(|()| file.to_path_buf()),
                Err(e) => Err(e),
            };

            match result {
                Ok(file) => {
                    report_step(LoadStep::Done);
                    report.loaded.push(target.name.clone());
                    report.sources.push((target.name.clone(), file));
                },
                Err(e) if self.config.best_effort => {
                    error!(database = %target.name, error = %e, "Load failed, continuing");
                    report.failed.push((target.name.clone(), e.to_string()));
                    first_error.get_or_insert(e);
                },
                Err(e) => return Err(e),
            }
        }

        if report.loaded.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(report)
    }

    /// Drop, recreate and import one database
    pub async fn load_database(
        &self,
        database: &str,
        file: &Path,
        progress: &(dyn Fn(LoadStep) + Send + Sync),
    ) -> ImportResult<()> {
        let timeout = self.config.import_timeout();

        progress(LoadStep::Drop);
        self.timed(database, LoadFailure::Drop, timeout, self.admin.drop_database(database))
            .await?;

        progress(LoadStep::Create);
        self.timed(database, LoadFailure::Create, timeout, self.admin.create_database(database))
            .await?;

        progress(LoadStep::Import);
        let started = std::time::Instant::now();
        self.timed(database, LoadFailure::Import, timeout, self.admin.import_file(database, file))
            .await?;

        info!(
            database,
            file = %file.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Database loaded"
        );
        Ok(())
    }

    async fn timed(
        &self,
        database: &str,
        kind: LoadFailure,
        timeout: Duration,
        op: impl Future<Output = anyhow::Result<()>>,
    ) -> ImportResult<()> {
        match tokio::time::timeout(timeout, op).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ImportError::load(database, kind, format!("{:#}", e))),
            Err(_) => Err(ImportError::load(
                database,
                LoadFailure::Timeout,
                format!("{} not finished after {}s", kind, timeout.as_secs()),
            )),
        }
    }
}

/// All files below `dir`, one archive directory per level
async fn list_extracted(dir: &Path) -> ImportResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Each file goes to the first target whose pattern matches its name
pub fn assign_files(targets: &[DatabaseTarget], files: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let patterns: Vec<Option<glob::Pattern>> = targets
        .iter()
        .map(|t| glob::Pattern::new(&t.file_pattern).ok())
        .collect();
    let mut assigned = vec![Vec::new(); targets.len()];

    for file in files {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(index) = patterns
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.matches(name)))
        {
            assigned[index].push(file.clone());
        }
    }
    assigned
}

fn single_file<'a>(target: &DatabaseTarget, files: &'a [PathBuf]) -> ImportResult<&'a Path> {
    match files {
        [file] => Ok(file.as_path()),
        [] => Err(ImportError::load(
            &target.name,
            LoadFailure::MissingFile,
            format!("pattern {}", target.file_pattern),
        )),
        many => Err(ImportError::load(
            &target.name,
            LoadFailure::AmbiguousFile,
            format!(
                "pattern {} matches {}",
                target.file_pattern,
                many.iter()
                    .filter_map(|p| p.file_name())
                    .map(|n| n.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )),
    }
}
