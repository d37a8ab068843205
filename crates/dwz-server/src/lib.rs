//! DWZ Import Server Library
//!
//! Keeps local copies of the rating databases in sync with the dumps published on a
//! remote server.
//!
//! # Overview
//!
//! - **Import pipeline** (`import`): remote listing, freshness check, download,
//!   archive extraction and bulk loading, with retries and a single-flight guard
//! - **Scheduling**: cron-style automatic runs next to manual triggers
//! - **Status API** (`api`): run status, recent log lines and the last recorded import
//!
//! # Example
//!
//! ```no_run
//! use dwz_server::import::{ImportConfig, ImportOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ImportConfig::load(None)?;
//!     let orchestrator = ImportOrchestrator::new(config)?;
//!     orchestrator.start();
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod import;

// Re-export commonly used types
pub use error::AppError;
