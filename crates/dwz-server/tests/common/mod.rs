//! Shared fixtures for the import integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use zip::unstable::write::FileOptionsExt;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dwz_server::import::config::{DatabaseTarget, RemoteConfig};
use dwz_server::import::error::{ConnectionFailure, ImportError, ImportResult};
use dwz_server::import::{
    DatabaseAdmin, ImportConfig, ImportOrchestrator, LoadProbe, RemoteConnector, RemoteEntry,
    RemoteSession,
};

pub const PASSWORD: &str = "secret";

pub fn mod_time(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, day, 2, 0, 0).unwrap()
}

/// Encrypted ZIP with the given entries, as bytes
pub fn zip_bytes(entries: &[(&str, &str)], password: Option<&str>) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        let mut options = zip::write::SimpleFileOptions::default();
        if let Some(pw) = password {
            options = options.with_deprecated_encryption(pw.as_bytes());
        }
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn mvdsb_dump() -> Vec<u8> {
    zip_bytes(
        &[(
            "mvdsb.sql",
            "-- MySQL dump\nCREATE TABLE spieler (id INT);\nINSERT INTO spieler VALUES (1);\n",
        )],
        Some(PASSWORD),
    )
}

#[derive(Clone)]
pub struct RemoteFile {
    pub entry: RemoteEntry,
    pub content: Vec<u8>,
    /// Serve the content one byte per 100ms
    pub trickle: bool,
}

impl RemoteFile {
    pub fn new(name: &str, content: Vec<u8>, day: u32) -> Self {
        Self {
            entry: RemoteEntry {
                name: name.to_string(),
                size: content.len() as u64,
                mod_time: mod_time(day),
                is_file: true,
            },
            content,
            trickle: false,
        }
    }

    pub fn trickling(mut self) -> Self {
        self.trickle = true;
        self
    }
}

/// Reader of a stalled transfer
struct TrickleReader {
    inner: Cursor<Vec<u8>>,
}

impl Read for TrickleReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(100));
        let end = buf.len().min(1);
        self.inner.read(&mut buf[..end])
    }
}

/// In-memory remote server
#[derive(Default)]
pub struct FakeConnector {
    pub files: Mutex<Vec<RemoteFile>>,
    pub connects: AtomicU32,
    pub opens: Arc<AtomicU32>,
    /// Connections fail with this kind while `fail_remaining` is non-zero
    pub failure: Mutex<Option<ConnectionFailure>>,
    pub fail_remaining: AtomicU32,
}

impl FakeConnector {
    pub fn with_files(files: Vec<RemoteFile>) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(files),
            ..Self::default()
        })
    }

    pub fn fail_next(&self, kind: ConnectionFailure, times: u32) {
        *self.failure.lock().unwrap() = Some(kind);
        self.fail_remaining.store(times, Ordering::SeqCst);
    }

    pub fn set_files(&self, files: Vec<RemoteFile>) {
        *self.files.lock().unwrap() = files;
    }
}

impl RemoteConnector for FakeConnector {
    fn connect(&self, config: &RemoteConfig) -> ImportResult<Box<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let kind = self.failure.lock().unwrap().unwrap_or(ConnectionFailure::Other);
            return Err(ImportError::Connection {
                host: config.address(),
                kind,
                message: "simulated".to_string(),
            });
        }

        Ok(Box::new(FakeSession {
            files: self.files.lock().unwrap().clone(),
            opens: self.opens.clone(),
        }))
    }
}

struct FakeSession {
    files: Vec<RemoteFile>,
    opens: Arc<AtomicU32>,
}

impl RemoteSession for FakeSession {
    fn list(&mut self, _path: &str) -> ImportResult<Vec<RemoteEntry>> {
        Ok(self.files.iter().map(|f| f.entry.clone()).collect())
    }

    fn open(&mut self, path: &str) -> ImportResult<Box<dyn Read + Send + '_>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let name = path.rsplit('/').next().unwrap_or(path);
        let file = self
            .files
            .iter()
            .find(|f| f.entry.name == name)
            .ok_or_else(|| ImportError::Transfer {
                file: name.to_string(),
                message: "no such file".to_string(),
            })?;
        let content = Cursor::new(file.content.clone());
        if file.trickle {
            return Ok(Box::new(TrickleReader { inner: content }));
        }
        Ok(Box::new(content))
    }
}

/// Database server that records what it was asked to do
#[derive(Default)]
pub struct FakeAdmin {
    pub calls: Mutex<Vec<String>>,
    /// Contents of every imported script, in import order
    pub scripts: Mutex<Vec<String>>,
    pub fail_import: Mutex<HashSet<String>>,
    /// Imports sleep this long before doing anything
    pub import_delay: Option<Duration>,
}

impl FakeAdmin {
    pub fn slow(import_delay: Duration) -> Self {
        Self {
            import_delay: Some(import_delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn fail_import_for(&self, database: &str) {
        self.fail_import.lock().unwrap().insert(database.to_string());
    }
}

#[async_trait]
impl DatabaseAdmin for FakeAdmin {
    async fn drop_database(&self, name: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("drop {}", name));
        Ok(())
    }

    async fn create_database(&self, name: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(format!("create {}", name));
        Ok(())
    }

    async fn import_file(&self, name: &str, script: &Path) -> anyhow::Result<()> {
        if let Some(delay) = self.import_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_import.lock().unwrap().contains(name) {
            anyhow::bail!("ERROR 1064 (42000): You have an error in your SQL syntax");
        }
        let sql = std::fs::read_to_string(script)?;
        anyhow::ensure!(sql.contains("CREATE TABLE"), "unexpected script content");

        let file = script.file_name().unwrap().to_string_lossy().into_owned();
        self.calls.lock().unwrap().push(format!("import {} {}", name, file));
        self.scripts.lock().unwrap().push(sql);
        Ok(())
    }
}

pub struct FixedLoad(pub f64);

impl LoadProbe for FixedLoad {
    fn load_average(&self) -> std::io::Result<f64> {
        Ok(self.0)
    }
}

/// Config for a single `mvdsb` target with everything rooted in `root`
pub fn test_config(root: &Path) -> ImportConfig {
    let mut config = ImportConfig::default();
    config.remote.host = "dumps.test".to_string();
    config.remote.remote_path = "/export".to_string();
    config.remote.file_patterns = vec!["mvdsb_*.zip".to_string()];
    config.databases.targets = vec![DatabaseTarget {
        name: "mvdsb".to_string(),
        file_pattern: "mvdsb*.sql".to_string(),
    }];
    config
        .archive
        .passwords
        .insert("mvdsb".to_string(), PASSWORD.to_string());
    config.freshness.metadata_file = root.join("state").join("import_metadata.json");
    config.freshness.compare_checksum = true;
    config.retry.max_attempts = 1;
    config.retry.delay_secs = 0;
    config.schedule.enabled = false;
    config.storage.temp_dir = root.join("work");
    config.load_check.enabled = false;
    config
}

/// Add the `portal64_bdw` target next to `mvdsb`
pub fn with_portal_target(mut config: ImportConfig) -> ImportConfig {
    config.remote.file_patterns.push("portal64_bdw_*.zip".to_string());
    config.databases.targets.push(DatabaseTarget {
        name: "portal64_bdw".to_string(),
        file_pattern: "portal64_bdw*.sql".to_string(),
    });
    config
        .archive
        .passwords
        .insert("portal64_bdw".to_string(), "portal-secret".to_string());
    config
}

pub fn orchestrator(
    config: ImportConfig,
    connector: Arc<FakeConnector>,
    admin: Arc<FakeAdmin>,
) -> Arc<ImportOrchestrator> {
    ImportOrchestrator::builder(config)
        .connector(connector)
        .database_admin(admin)
        .load_probe(Arc::new(FixedLoad(0.1)))
        .build()
        .unwrap()
}
