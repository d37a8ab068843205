//! Password-protected archive extraction
//!
//! Each archive is decrypted with the password of the database it feeds. Extraction runs
//! on a blocking worker under a timeout and the output is validated: an archive must
//! yield at least one file, and at least one of those must contain SQL statements.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use zip::result::ZipError;

use super::config::ArchiveConfig;
use super::error::{ExtractionFailure, ImportError, ImportResult};
use super::models::FileDescriptor;

/// Lines inspected per file when looking for SQL statements
pub const MAX_SQL_SCAN_LINES: usize = 10_000;

const SQL_KEYWORDS: &[&str] = &[
    "CREATE", "INSERT", "DROP", "ALTER", "UPDATE", "DELETE", "REPLACE", "TRUNCATE",
];

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub struct ArchiveExtractor {
    config: ArchiveConfig,
    timeout: Duration,
}

/// Directory under `dest` that receives the contents of `archive_filename`
pub fn archive_output_dir(dest: &Path, archive_filename: &str) -> PathBuf {
    dest.join(archive_filename)
}

impl ArchiveExtractor {
    pub fn new(config: ArchiveConfig) -> Self {
        let timeout = config.extraction_timeout();
        Self { config, timeout }
    }

    /// Override the per-archive extraction timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extract every downloaded archive in `files` from `download_dir`
    ///
    /// Each archive gets its own directory under `dest` (see [`archive_output_dir`]), so
    /// two archives shipping the same file name never overwrite each other.
    pub async fn extract_all(
        &self,
        files: &[FileDescriptor],
        download_dir: &Path,
        dest: &Path,
    ) -> ImportResult<Vec<FileDescriptor>> {
        let mut extracted = Vec::with_capacity(files.len());
        for file in files {
            let archive = download_dir.join(&file.filename);
            let out_dir = archive_output_dir(dest, &file.filename);
            self.extract(&archive, &file.database, &out_dir).await?;
            extracted.push(file.clone().mark_extracted());
        }
        Ok(extracted)
    }

    /// Extract one archive, returning the paths written
    #[instrument(skip(self, archive, dest), fields(archive = %archive.display()))]
    pub async fn extract(
        &self,
        archive: &Path,
        database: &str,
        dest: &Path,
    ) -> ImportResult<Vec<PathBuf>> {
        let archive_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        let password = self.config.password_for(database).map(str::to_owned);
        if password.is_none() {
            debug!(database, "No archive password configured");
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let task = tokio::task::spawn_blocking({
            let archive = archive.to_path_buf();
            let dest = dest.to_path_buf();
            let cancel = cancel.clone();
            move || extract_archive_sync(&archive, password.as_deref(), &dest, &cancel)
        });

        let timeout = self.timeout;
        let written = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined??,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                return Err(ImportError::extraction(
                    archive_name,
                    ExtractionFailure::Timeout,
                    format!("not finished after {:?}", timeout),
                ));
            },
        };

        validate_output(&archive_name, &written).await?;
        info!(archive = %archive_name, files = written.len(), "Archive extracted");
        Ok(written)
    }
}

async fn validate_output(archive_name: &str, written: &[PathBuf]) -> ImportResult<()> {
    if written.is_empty() {
        return Err(ImportError::extraction(
            archive_name,
            ExtractionFailure::EmptyArchive,
            "no files extracted",
        ));
    }

    let paths = written.to_vec();
    let has_sql = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        for path in &paths {
            if contains_sql(path)? {
                return Ok(true);
            }
        }
        Ok(false)
    })
    .await??;

    if !has_sql {
        return Err(ImportError::extraction(
            archive_name,
            ExtractionFailure::NoSqlContent,
            format!("none of {} extracted files contains SQL statements", written.len()),
        ));
    }
    Ok(())
}

fn extract_archive_sync(
    archive_path: &Path,
    password: Option<&str>,
    dest: &Path,
    cancel: &AtomicBool,
) -> ImportResult<Vec<PathBuf>> {
    let archive_name = archive_path.display().to_string();
    let corrupt = |message: String| {
        ImportError::extraction(archive_name.clone(), ExtractionFailure::Corrupt, message)
    };

    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let entry = match password {
            Some(pw) => archive.by_index_decrypt(i, pw.as_bytes()),
            None => archive.by_index(i),
        };
        let mut entry = entry.map_err(|e| match e {
            ZipError::InvalidPassword => ImportError::extraction(
                archive_name.clone(),
                ExtractionFailure::InvalidPassword,
                "archive rejected the configured password",
            ),
            ZipError::UnsupportedArchive(msg) if msg == ZipError::PASSWORD_REQUIRED => {
                ImportError::extraction(
                    archive_name.clone(),
                    ExtractionFailure::InvalidPassword,
                    "archive is encrypted but no password is configured",
                )
            },
            other => corrupt(other.to_string()),
        })?;

        if entry.is_dir() {
            continue;
        }

        // Entries are flattened into `dest`; unsafe paths are skipped.
        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        else {
            warn!(entry = %entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };

        let out_path = dest.join(&name);
        let out_file = match File::create_new(&out_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(corrupt(format!(
                    "several entries extract to {}",
                    out_path.display()
                )));
            },
            Err(e) => return Err(e.into()),
        };
        let mut out = BufWriter::new(out_file);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            if cancel.load(Ordering::Relaxed) {
                drop(out);
                let _ = std::fs::remove_file(&out_path);
                return Err(ImportError::extraction(
                    archive_name.clone(),
                    ExtractionFailure::Timeout,
                    "cancelled",
                ));
            }
            let n = entry.read(&mut buffer).map_err(|e| corrupt(e.to_string()))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
        }
        out.flush()?;

        debug!(file = %out_path.display(), bytes = entry.size(), "Extracted");
        written.push(out_path);
    }

    Ok(written)
}

/// Whether a file contains DDL/DML statements outside of comments
pub fn contains_sql(path: &Path) -> std::io::Result<bool> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut in_block_comment = false;

    for _ in 0..MAX_SQL_SCAN_LINES {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let mut rest = text.trim();

        if in_block_comment {
            match rest.find("*/") {
                Some(end) => {
                    in_block_comment = false;
                    rest = rest[end + 2..].trim_start();
                },
                None => continue,
            }
        }

        if rest.is_empty() || rest.starts_with("--") || rest.starts_with('#') {
            continue;
        }
        if let Some(body) = rest.strip_prefix("/*") {
            match body.find("*/") {
                Some(end) => rest = body[end + 2..].trim_start(),
                None => {
                    in_block_comment = true;
                    continue;
                },
            }
        }

        if starts_with_keyword(rest) {
            return Ok(true);
        }
    }

    Ok(false)
}

fn starts_with_keyword(statement: &str) -> bool {
    let word: String = statement
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    SQL_KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::unstable::write::FileOptionsExt;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)], password: Option<&str>) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            let mut options = SimpleFileOptions::default();
            if let Some(pw) = password {
                options = options.with_deprecated_encryption(pw.as_bytes());
            }
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn extractor(password: &str) -> ArchiveExtractor {
        let mut config = ArchiveConfig::default();
        config.passwords.insert("mvdsb".to_string(), password.to_string());
        ArchiveExtractor::new(config)
    }

    #[test]
    fn test_contains_sql_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");

        std::fs::write(&path, "-- CREATE TABLE x\n# INSERT\n/* DROP\n still comment */\n\n").unwrap();
        assert!(!contains_sql(&path).unwrap());

        std::fs::write(
            &path,
            "-- MySQL dump\n/*!40101 SET NAMES utf8 */;\n\ncreate table spieler (id int);\n",
        )
        .unwrap();
        assert!(contains_sql(&path).unwrap());
    }

    #[test]
    fn test_keyword_must_be_a_whole_word() {
        assert!(starts_with_keyword("INSERT INTO t VALUES (1);"));
        assert!(starts_with_keyword("Drop database x"));
        assert!(!starts_with_keyword("CREATED_BY=me"));
        assert!(!starts_with_keyword("SELECT 1"));
    }

    #[tokio::test]
    async fn test_extract_with_database_password() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mvdsb_20250806.zip");
        write_zip(
            &archive,
            &[("dump/mvdsb.sql", "CREATE TABLE spieler (id INT);\n")],
            Some("mv-secret"),
        );

        let dest = dir.path().join("out");
        let written = extractor("mv-secret").extract(&archive, "mvdsb", &dest).await.unwrap();
        assert_eq!(written, vec![dest.join("mvdsb.sql")]);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mvdsb.zip");
        write_zip(&archive, &[("mvdsb.sql", "CREATE TABLE t (id INT);\n")], Some("right"));

        let err = extractor("wrong")
            .extract(&archive, "mvdsb", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::InvalidPassword | ExtractionFailure::Corrupt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_archive_without_sql_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mvdsb.zip");
        write_zip(&archive, &[("readme.txt", "nothing to see\n")], None);

        let err = ArchiveExtractor::new(ArchiveConfig::default())
            .extract(&archive, "mvdsb", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::NoSqlContent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        write_zip(&archive, &[], None);

        let err = ArchiveExtractor::new(ArchiveConfig::default())
            .extract(&archive, "", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::EmptyArchive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        let err = ArchiveExtractor::new(ArchiveConfig::default())
            .extract(&archive, "", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::Corrupt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_archives_sharing_file_names_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        write_zip(
            &downloads.join("mvdsb_20250806.zip"),
            &[("mvdsb.sql", "CREATE TABLE from_0806 (id INT);\n")],
            Some("mv-secret"),
        );
        write_zip(
            &downloads.join("mvdsb_20250807.zip"),
            &[("mvdsb.sql", "CREATE TABLE from_0807 (id INT);\n")],
            Some("mv-secret"),
        );

        let t = chrono::Utc::now();
        let files = vec![
            FileDescriptor::new("mvdsb_20250807.zip", 0, t).with_database("mvdsb"),
            FileDescriptor::new("mvdsb_20250806.zip", 0, t).with_database("mvdsb"),
        ];
        let dest = dir.path().join("extracted");
        let extracted = extractor("mv-secret")
            .extract_all(&files, &downloads, &dest)
            .await
            .unwrap();
        assert!(extracted.iter().all(|f| f.extracted));

        let newer = archive_output_dir(&dest, "mvdsb_20250807.zip").join("mvdsb.sql");
        let older = archive_output_dir(&dest, "mvdsb_20250806.zip").join("mvdsb.sql");
        assert!(std::fs::read_to_string(newer).unwrap().contains("from_0807"));
        assert!(std::fs::read_to_string(older).unwrap().contains("from_0806"));
    }

    #[tokio::test]
    async fn test_entries_flattening_onto_one_name_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mvdsb.zip");
        write_zip(
            &archive,
            &[
                ("2025-08-06/mvdsb.sql", "CREATE TABLE a (id INT);\n"),
                ("2025-08-07/mvdsb.sql", "CREATE TABLE b (id INT);\n"),
            ],
            None,
        );

        let err = ArchiveExtractor::new(ArchiveConfig::default())
            .extract(&archive, "mvdsb", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::Corrupt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_extraction_past_timeout_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("mvdsb.zip");
        let dump = "INSERT INTO spieler VALUES (1, 'Muster', 1850);\n".repeat(200_000);
        write_zip(&archive, &[("mvdsb.sql", dump.as_str())], None);

        let err = ArchiveExtractor::new(ArchiveConfig::default())
            .with_timeout(Duration::ZERO)
            .extract(&archive, "mvdsb", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Extraction {
                kind: ExtractionFailure::Timeout,
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
