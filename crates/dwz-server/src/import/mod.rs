//! Scheduled import of the rating database dumps
//!
//! A run lists the dump archives on the remote server, checks whether they are newer
//! than the last successful import, and if so downloads, decrypts and loads them into
//! the local target databases. `ImportOrchestrator` drives runs; `StatusTracker` holds
//! the state the status API reports.

pub mod config;
pub mod error;
pub mod extract;
pub mod freshness;
pub mod load_check;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod schedule;
pub mod status;

pub use config::ImportConfig;
pub use error::{ImportError, ImportResult};
pub use extract::ArchiveExtractor;
pub use freshness::FreshnessChecker;
pub use load_check::{LoadProbe, ProcLoadAverage};
pub use loader::{BulkDatabaseLoader, DatabaseAdmin, MySqlAdmin};
pub use models::{
    FileDescriptor, FreshnessReason, FreshnessVerdict, ImportMetadataRecord, ImportState,
    ImportStatus, LogEntry, TriggerSource,
};
pub use orchestrator::{ImportOrchestrator, ImportOrchestratorBuilder};
pub use remote::{RemoteConnector, RemoteEntry, RemoteFileFetcher, RemoteSession};
pub use schedule::ImportSchedule;
pub use status::StatusTracker;
