//! Remote dump server access
//!
//! `RemoteFileFetcher` lists and downloads dump archives through a `RemoteConnector`.
//! Sessions are synchronous (both `ssh2` and `suppaftp` block), so every session is
//! opened and used inside `tokio::task::spawn_blocking`.

pub mod ftp;
pub mod sftp;

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::config::{DatabaseTarget, RemoteConfig, RemoteProtocol};
use super::error::{ConnectionFailure, ImportError, ImportResult};
use super::models::FileDescriptor;

pub use ftp::FtpConnector;
pub use sftp::SftpConnector;

/// Copy buffer size for downloads
pub const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Percent checkpoints reported while a file is copied
const PROGRESS_CHECKPOINTS: [u8; 4] = [25, 50, 75, 100];

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_file: bool,
}

/// An authenticated file-transfer session
pub trait RemoteSession: Send {
    fn list(&mut self, path: &str) -> ImportResult<Vec<RemoteEntry>>;

    fn open(&mut self, path: &str) -> ImportResult<Box<dyn Read + Send + '_>>;
}

/// Opens sessions against the configured remote host
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, config: &RemoteConfig) -> ImportResult<Box<dyn RemoteSession>>;
}

/// Connector for the configured protocol
pub fn connector_for(protocol: RemoteProtocol) -> Arc<dyn RemoteConnector> {
    match protocol {
        RemoteProtocol::Sftp => Arc::new(SftpConnector),
        RemoteProtocol::Ftp => Arc::new(FtpConnector),
    }
}

/// Download progress callback: `(filename, percent)`
pub type DownloadProgress = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Lists and retrieves dump files from the remote host
pub struct RemoteFileFetcher {
    config: RemoteConfig,
    targets: Vec<DatabaseTarget>,
    connector: Arc<dyn RemoteConnector>,
}

impl RemoteFileFetcher {
    pub fn new(
        config: RemoteConfig,
        targets: Vec<DatabaseTarget>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        Self {
            config,
            targets,
            connector,
        }
    }

    /// List remote files matching the configured patterns
    ///
    /// Fails with `NoMatchingFiles` when nothing matches; deciding that there is nothing
    /// new to import is left to the freshness check. When several archives feed the same
    /// database only the newest is returned.
    #[instrument(skip(self), fields(host = %self.config.host, path = %self.config.remote_path))]
    pub async fn list_files(&self) -> ImportResult<Vec<FileDescriptor>> {
        let config = self.config.clone();
        let targets = self.targets.clone();
        let connector = self.connector.clone();
        let timeout = self.config.listing_timeout();

        let task = tokio::task::spawn_blocking(move || {
            let mut session = connector.connect(&config)?;
            let entries = session.list(&config.remote_path)?;
            debug!(entries = entries.len(), "Remote directory listed");

            let matched = match_entries(&entries, &config.file_patterns, &targets);
            if matched.is_empty() {
                return Err(ImportError::NoMatchingFiles {
                    path: config.remote_path.clone(),
                    patterns: config.file_patterns.clone(),
                });
            }

            let files = newest_per_database(matched);
            info!(files = files.len(), "Found matching remote files");
            Ok(files)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(ImportError::Connection {
                host: self.config.address(),
                kind: ConnectionFailure::Timeout,
                message: format!("listing not finished after {}s", timeout.as_secs()),
            }),
        }
    }

    /// Download `files` into `local_dir` over a single session
    ///
    /// Returns copies of the descriptors marked as downloaded and carrying their SHA-256.
    /// A file whose local size differs from the listed size is removed and fails the call,
    /// as does a transfer still running after `remote.transfer_timeout_secs`.
    #[instrument(skip(self, files, progress), fields(files = files.len()))]
    pub async fn download_files(
        &self,
        files: &[FileDescriptor],
        local_dir: &Path,
        progress: Option<DownloadProgress>,
    ) -> ImportResult<Vec<FileDescriptor>> {
        let config = self.config.clone();
        let connector = self.connector.clone();
        let label = files_label(files);
        let files = files.to_vec();
        let local_dir = local_dir.to_path_buf();
        let cancel = Arc::new(AtomicBool::new(false));
        let timeout = self.config.transfer_timeout();

        let task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || {
                std::fs::create_dir_all(&local_dir)?;
                let mut session = connector.connect(&config)?;

                let mut downloaded = Vec::with_capacity(files.len());
                for file in files {
                    let remote_path = join_remote(&config.remote_path, &file.filename);
                    let local_path = local_target(&local_dir, &file.filename)?;

                    let copied = match copy_remote_file(
                        session.as_mut(),
                        &remote_path,
                        &local_path,
                        &file,
                        progress.as_ref(),
                        &cancel,
                    ) {
                        Ok(copied) => copied,
                        Err(e) => {
                            discard_partial(&local_path);
                            return Err(e);
                        },
                    };

                    if copied != file.size {
                        discard_partial(&local_path);
                        return Err(ImportError::Transfer {
                            file: file.filename.clone(),
                            message: format!("expected {} bytes, received {}", file.size, copied),
                        });
                    }

                    let checksum = Self::calculate_checksum(&local_path)?;
                    info!(file = %file.filename, bytes = copied, "Downloaded");
                    downloaded.push(file.with_checksum(checksum).mark_downloaded());
                }

                Ok(downloaded)
            }
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                Err(ImportError::Transfer {
                    file: label,
                    message: format!("download not finished after {}s", timeout.as_secs()),
                })
            },
        }
    }

    /// Lowercase hex SHA-256 of a local file
    pub fn calculate_checksum(path: &Path) -> ImportResult<String> {
        Ok(dwz_common::checksum::file_sha256(path)?)
    }
}

fn copy_remote_file(
    session: &mut dyn RemoteSession,
    remote_path: &str,
    local_path: &Path,
    file: &FileDescriptor,
    progress: Option<&DownloadProgress>,
    cancel: &AtomicBool,
) -> ImportResult<u64> {
    let transfer_error = |e: std::io::Error| ImportError::Transfer {
        file: file.filename.clone(),
        message: e.to_string(),
    };

    let mut reader = session.open(remote_path)?;
    let mut writer = BufWriter::new(File::create(local_path)?);
    let mut buffer = vec![0u8; DOWNLOAD_BUFFER_SIZE];
    let mut copied: u64 = 0;
    let mut next_checkpoint = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ImportError::Transfer {
                file: file.filename.clone(),
                message: "cancelled".to_string(),
            });
        }
        let n = reader.read(&mut buffer).map_err(transfer_error)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        copied += n as u64;

        if let Some(report) = progress {
            let percent = percent_of(copied, file.size);
            while next_checkpoint < PROGRESS_CHECKPOINTS.len()
                && percent >= PROGRESS_CHECKPOINTS[next_checkpoint]
            {
                report(&file.filename, PROGRESS_CHECKPOINTS[next_checkpoint]);
                next_checkpoint += 1;
            }
        }
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(copied)
}

fn files_label(files: &[FileDescriptor]) -> String {
    files
        .iter()
        .map(|f| f.filename.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

fn discard_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

// Remote names come from a listing; anything that is not a bare file name is refused.
fn local_target(dir: &Path, filename: &str) -> ImportResult<PathBuf> {
    match Path::new(filename).file_name() {
        Some(name) if name == std::ffi::OsStr::new(filename) => Ok(dir.join(name)),
        _ => Err(ImportError::Transfer {
            file: filename.to_string(),
            message: "remote file name is not a plain file name".to_string(),
        }),
    }
}

/// Keep files matching a pattern, first pattern wins, and tag each with its database
pub fn match_entries(
    entries: &[RemoteEntry],
    patterns: &[String],
    targets: &[DatabaseTarget],
) -> Vec<FileDescriptor> {
    let compiled: Vec<(String, glob::Pattern)> = patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok().map(|g| (p.clone(), g)))
        .collect();

    entries
        .iter()
        .filter(|entry| entry.is_file)
        .filter_map(|entry| {
            let (pattern, _) = compiled.iter().find(|(_, g)| g.matches(&entry.name))?;
            let database = infer_database(pattern, &entry.name, targets);
            Some(
                FileDescriptor::new(entry.name.clone(), entry.size, entry.mod_time)
                    .with_pattern(pattern.clone())
                    .with_database(database),
            )
        })
        .collect()
}

/// Keep one archive per database: the newest by modification time, ties going to the
/// greater file name
///
/// Files without a database are kept as they are.
pub fn newest_per_database(files: Vec<FileDescriptor>) -> Vec<FileDescriptor> {
    let mut selected: Vec<FileDescriptor> = Vec::with_capacity(files.len());
    for file in files {
        if file.database.is_empty() {
            selected.push(file);
            continue;
        }
        match selected.iter_mut().find(|s| s.database == file.database) {
            Some(current) => {
                let database = file.database.clone();
                let newer = (file.mod_time, &file.filename) > (current.mod_time, &current.filename);
                let (kept, ignored) = if newer {
                    (file.filename.clone(), std::mem::replace(current, file).filename)
                } else {
                    (current.filename.clone(), file.filename)
                };
                info!(
                    database = %database,
                    kept = %kept,
                    ignored = %ignored,
                    "Several archives for one database, using the newest"
                );
            },
            None => selected.push(file),
        }
    }
    selected
}

/// Target database for a file: pattern substrings first, then filename substrings
pub fn infer_database(pattern: &str, filename: &str, targets: &[DatabaseTarget]) -> String {
    let pattern = pattern.to_ascii_lowercase();
    let filename = filename.to_ascii_lowercase();

    targets
        .iter()
        .find(|t| pattern.contains(&t.name.to_ascii_lowercase()))
        .or_else(|| {
            targets
                .iter()
                .find(|t| filename.contains(&t.name.to_ascii_lowercase()))
        })
        .map(|t| t.name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn targets() -> Vec<DatabaseTarget> {
        vec![
            DatabaseTarget {
                name: "mvdsb".to_string(),
                file_pattern: "mvdsb*.sql".to_string(),
            },
            DatabaseTarget {
                name: "portal64_bdw".to_string(),
                file_pattern: "portal64_bdw*.sql".to_string(),
            },
        ]
    }

    fn entry(name: &str, is_file: bool) -> RemoteEntry {
        RemoteEntry {
            name: name.to_string(),
            size: 10,
            mod_time: Utc.with_ymd_and_hms(2025, 8, 6, 2, 0, 0).unwrap(),
            is_file,
        }
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        let patterns = vec!["mvdsb_*.zip".to_string(), "*.zip".to_string()];
        let files = match_entries(
            &[entry("mvdsb_20250806.zip", true), entry("portal64_bdw_20250806.zip", true)],
            &patterns,
            &targets(),
        );

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].pattern, "mvdsb_*.zip");
        assert_eq!(files[0].database, "mvdsb");
        assert_eq!(files[1].pattern, "*.zip");
        assert_eq!(files[1].database, "portal64_bdw");
    }

    #[test]
    fn test_directories_and_unmatched_entries_skipped() {
        let patterns = vec!["*.zip".to_string()];
        let files = match_entries(
            &[entry("archive.zip", false), entry("readme.txt", true)],
            &patterns,
            &targets(),
        );
        assert!(files.is_empty());
    }

    #[test]
    fn test_unknown_database_is_empty() {
        assert_eq!(infer_database("*.zip", "dump_x.zip", &targets()), "");
        assert_eq!(infer_database("*.zip", "MVDSB_X.ZIP", &targets()), "mvdsb");
    }

    #[test]
    fn test_percent_checkpoints() {
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(50, 200), 25);
        assert_eq!(percent_of(300, 200), 100);
    }

    #[test]
    fn test_remote_and_local_paths() {
        assert_eq!(join_remote("/dumps/", "a.zip"), "/dumps/a.zip");
        assert_eq!(join_remote("/", "a.zip"), "/a.zip");

        let dir = Path::new("/tmp/x");
        assert!(local_target(dir, "a.zip").is_ok());
        assert!(local_target(dir, "../a.zip").is_err());
        assert!(local_target(dir, "sub/a.zip").is_err());
    }

    #[test]
    fn test_newest_archive_per_database_is_kept() {
        let day = |d: u32| Utc.with_ymd_and_hms(2025, 8, d, 2, 0, 0).unwrap();
        let files = vec![
            FileDescriptor::new("mvdsb_20250807.zip", 10, day(7)).with_database("mvdsb"),
            FileDescriptor::new("mvdsb_20250806.zip", 10, day(6)).with_database("mvdsb"),
            FileDescriptor::new("portal64_bdw_20250805.zip", 10, day(5)).with_database("portal64_bdw"),
            FileDescriptor::new("mvdsb_20250808.zip", 10, day(8)).with_database("mvdsb"),
            FileDescriptor::new("other_a.zip", 10, day(1)),
            FileDescriptor::new("other_b.zip", 10, day(2)),
        ];

        let names: Vec<String> = newest_per_database(files)
            .into_iter()
            .map(|f| f.filename)
            .collect();
        assert_eq!(
            names,
            vec!["mvdsb_20250808.zip", "portal64_bdw_20250805.zip", "other_a.zip", "other_b.zip"]
        );
    }

    #[test]
    fn test_same_mod_time_prefers_greater_name() {
        let t = Utc.with_ymd_and_hms(2025, 8, 6, 2, 0, 0).unwrap();
        let files = vec![
            FileDescriptor::new("mvdsb_b.zip", 10, t).with_database("mvdsb"),
            FileDescriptor::new("mvdsb_c.zip", 10, t).with_database("mvdsb"),
            FileDescriptor::new("mvdsb_a.zip", 10, t).with_database("mvdsb"),
        ];
        let selected = newest_per_database(files);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].filename, "mvdsb_c.zip");
    }
}
