//! Freshness check: is the remote data newer than what was last imported?
//!
//! The only durable state is a small JSON document describing the last successful
//! import. It is read at check time and rewritten atomically after a verified load.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::config::FreshnessConfig;
use super::error::{ImportError, ImportResult};
use super::models::{
    FileChangeReason, FileComparison, FileDescriptor, FreshnessReason, FreshnessVerdict,
    ImportMetadataDocument, ImportMetadataRecord,
};

/// Decides whether an import is worth running
pub struct FreshnessChecker {
    config: FreshnessConfig,
}

impl FreshnessChecker {
    pub fn new(config: FreshnessConfig) -> Self {
        Self { config }
    }

    pub fn metadata_path(&self) -> &Path {
        &self.config.metadata_file
    }

    /// Compare a fresh remote listing against the last successful import
    pub fn check_freshness(&self, remote_files: &[FileDescriptor]) -> FreshnessVerdict {
        if !self.config.enabled {
            return FreshnessVerdict {
                should_import: true,
                reason: FreshnessReason::FreshnessCheckDisabled,
                comparisons: Vec::new(),
            };
        }

        let Some(last) = self.load_metadata() else {
            let comparisons = remote_files
                .iter()
                .map(|remote| FileComparison {
                    remote: remote.clone().mark_newer(true),
                    last: None,
                    is_newer: true,
                    reasons: vec![FileChangeReason::FileNotFoundInLastImport],
                })
                .collect();
            return FreshnessVerdict {
                should_import: true,
                reason: FreshnessReason::FirstImport,
                comparisons,
            };
        };

        let comparisons: Vec<FileComparison> = remote_files
            .iter()
            .map(|remote| self.compare_file(remote, &last.files))
            .collect();

        let should_import = comparisons.iter().any(|c| c.is_newer);
        let reason = if should_import {
            FreshnessReason::NewerFilesAvailable
        } else {
            FreshnessReason::NoNewerFiles
        };

        debug!(
            files = comparisons.len(),
            newer = comparisons.iter().filter(|c| c.is_newer).count(),
            reason = reason.as_str(),
            "Freshness check finished"
        );

        FreshnessVerdict {
            should_import,
            reason,
            comparisons,
        }
    }

    /// Compare one remote file with its best match from the last import
    pub fn compare_file(&self, remote: &FileDescriptor, last_files: &[FileDescriptor]) -> FileComparison {
        let Some(last) = find_best_match(remote, last_files) else {
            return FileComparison {
                remote: remote.clone().mark_newer(true),
                last: None,
                is_newer: true,
                reasons: vec![FileChangeReason::FileNotFoundInLastImport],
            };
        };

        let mut reasons = Vec::new();
        if self.config.compare_timestamp && remote.mod_time > last.mod_time {
            reasons.push(FileChangeReason::NewerTimestamp);
        }
        if self.config.compare_size && remote.size != last.size {
            reasons.push(FileChangeReason::DifferentSize);
        }
        if self.config.compare_checksum {
            let (ours, theirs) = (remote.checksum_str(), last.checksum_str());
            if !ours.is_empty() && !theirs.is_empty() && !ours.eq_ignore_ascii_case(theirs) {
                reasons.push(FileChangeReason::DifferentChecksum);
            }
        }

        let is_newer = !reasons.is_empty();
        FileComparison {
            remote: remote.clone().mark_newer(is_newer),
            last: Some(last.clone()),
            is_newer,
            reasons,
        }
    }

    /// Persist a successful import
    ///
    /// The document is written to a temporary file in the same directory, synced and
    /// renamed over the old one, so readers see either the old or the new record.
    pub fn save_import_metadata(&self, files: &[FileDescriptor]) -> ImportResult<ImportMetadataRecord> {
        let record = ImportMetadataRecord {
            timestamp: Utc::now(),
            success: true,
            files: files.to_vec(),
        };
        let document = ImportMetadataDocument {
            last_import: record.clone(),
        };

        let path = &self.config.metadata_file;
        let dir = parent_dir(path);
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| ImportError::Metadata(format!("failed to serialize metadata: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| {
            ImportError::Metadata(format!("failed to replace {}: {}", path.display(), e.error))
        })?;

        debug!(path = %path.display(), files = files.len(), "Import metadata saved");
        Ok(record)
    }

    /// Last successful import, if one is on record
    pub fn get_last_import_info(&self) -> Option<ImportMetadataRecord> {
        self.load_metadata()
    }

    // Missing, unreadable and corrupt documents all mean "no prior import".
    fn load_metadata(&self) -> Option<ImportMetadataRecord> {
        let path = &self.config.metadata_file;
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read import metadata");
                return None;
            },
        };

        match serde_json::from_slice::<ImportMetadataDocument>(&bytes) {
            Ok(doc) if doc.last_import.success => Some(doc.last_import),
            Ok(_) => {
                warn!(path = %path.display(), "Import metadata records an unsuccessful import");
                None
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Import metadata is corrupt");
                None
            },
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Exact filename first, then same pattern, then same target database
fn find_best_match<'a>(
    remote: &FileDescriptor,
    last_files: &'a [FileDescriptor],
) -> Option<&'a FileDescriptor> {
    last_files
        .iter()
        .find(|f| f.filename == remote.filename)
        .or_else(|| {
            (!remote.pattern.is_empty())
                .then(|| last_files.iter().find(|f| f.pattern == remote.pattern))
                .flatten()
        })
        .or_else(|| {
            (!remote.database.is_empty())
                .then(|| last_files.iter().find(|f| f.database == remote.database))
                .flatten()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, day, 2, 0, 0).unwrap()
    }

    fn checker(dir: &Path) -> FreshnessChecker {
        FreshnessChecker::new(FreshnessConfig {
            enabled: true,
            compare_timestamp: true,
            compare_size: true,
            compare_checksum: true,
            metadata_file: dir.join("meta").join("import_metadata.json"),
        })
    }

    fn mvdsb(day: u32, size: u64) -> FileDescriptor {
        FileDescriptor::new(format!("mvdsb_202508{:02}.zip", day), size, t(day))
            .with_pattern("mvdsb_*.zip")
            .with_database("mvdsb")
    }

    #[test]
    fn test_best_match_order() {
        let last = vec![
            FileDescriptor::new("other.zip", 1, t(1)).with_database("mvdsb"),
            FileDescriptor::new("mvdsb_20250801.zip", 1, t(1)).with_pattern("mvdsb_*.zip"),
        ];

        let by_pattern = mvdsb(6, 1);
        assert_eq!(find_best_match(&by_pattern, &last).unwrap().filename, "mvdsb_20250801.zip");

        let by_name = FileDescriptor::new("other.zip", 1, t(6));
        assert_eq!(find_best_match(&by_name, &last).unwrap().filename, "other.zip");

        let by_database = FileDescriptor::new("x.zip", 1, t(6)).with_database("mvdsb");
        assert_eq!(find_best_match(&by_database, &last).unwrap().filename, "other.zip");

        let unmatched = FileDescriptor::new("y.zip", 1, t(6));
        assert!(find_best_match(&unmatched, &last).is_none());
    }

    #[test]
    fn test_empty_pattern_does_not_match_empty_pattern() {
        let last = vec![FileDescriptor::new("a.zip", 1, t(1))];
        let remote = FileDescriptor::new("b.zip", 1, t(1));
        assert!(find_best_match(&remote, &last).is_none());
    }

    #[test]
    fn test_reasons_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path());
        let last = vec![mvdsb(1, 100).with_checksum("aaa")];
        let remote = mvdsb(6, 200).with_checksum("bbb");

        let comparison = checker.compare_file(&remote, &last);
        assert!(comparison.is_newer);
        assert!(comparison.remote.is_newer);
        assert_eq!(
            comparison.reasons,
            vec![
                FileChangeReason::NewerTimestamp,
                FileChangeReason::DifferentSize,
                FileChangeReason::DifferentChecksum
            ]
        );
    }

    #[test]
    fn test_checksum_ignored_when_one_side_missing() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path());
        let last = vec![mvdsb(6, 100).with_checksum("aaa")];
        let remote = mvdsb(6, 100);

        let comparison = checker.compare_file(&remote, &last);
        assert!(!comparison.is_newer);
        assert!(comparison.reasons.is_empty());
    }

    #[test]
    fn test_older_timestamp_is_not_newer() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path());
        let last = vec![mvdsb(6, 100)];
        let mut remote = mvdsb(6, 100);
        remote.mod_time = t(2);

        assert!(!checker.compare_file(&remote, &last).is_newer);
    }

    #[test]
    fn test_disabled_toggles_suppress_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let checker = FreshnessChecker::new(FreshnessConfig {
            enabled: true,
            compare_timestamp: false,
            compare_size: false,
            compare_checksum: false,
            metadata_file: dir.path().join("m.json"),
        });
        let last = vec![mvdsb(1, 100)];
        let comparison = checker.compare_file(&mvdsb(6, 999), &last);
        assert!(!comparison.is_newer);
    }

    #[test]
    fn test_disabled_check_always_imports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FreshnessConfig::default();
        config.enabled = false;
        config.metadata_file = dir.path().join("m.json");
        let checker = FreshnessChecker::new(config);

        let verdict = checker.check_freshness(&[mvdsb(6, 1)]);
        assert!(verdict.should_import);
        assert_eq!(verdict.reason, FreshnessReason::FreshnessCheckDisabled);
    }

    #[test]
    fn test_failed_record_counts_as_first_import() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path());
        let doc = ImportMetadataDocument {
            last_import: ImportMetadataRecord {
                timestamp: t(1),
                success: false,
                files: vec![mvdsb(6, 1)],
            },
        };
        std::fs::create_dir_all(checker.metadata_path().parent().unwrap()).unwrap();
        std::fs::write(checker.metadata_path(), serde_json::to_vec(&doc).unwrap()).unwrap();

        let verdict = checker.check_freshness(&[mvdsb(6, 1)]);
        assert_eq!(verdict.reason, FreshnessReason::FirstImport);
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let checker = checker(dir.path());
        checker.save_import_metadata(&[mvdsb(1, 1)]).unwrap();
        checker.save_import_metadata(&[mvdsb(6, 2)]).unwrap();

        let record = checker.get_last_import_info().unwrap();
        assert_eq!(record.files, vec![mvdsb(6, 2)]);

        let leftovers: Vec<_> = std::fs::read_dir(checker.metadata_path().parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1, "temporary files must not be left behind");
    }
}
