//! DWZ Common Library
//!
//! Shared pieces used by the DWZ import service.
//!
//! - **Error Handling**: [`DwzError`] and the [`Result`] alias
//! - **Checksums**: streaming SHA-256 digests of downloaded dumps
//! - **Logging**: `tracing` subscriber bootstrap for binaries
//!
//! # Example
//!
//! ```no_run
//! use dwz_common::checksum::file_sha256;
//!
//! fn fingerprint(path: &str) -> dwz_common::Result<String> {
//!     file_sha256(path)
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{DwzError, Result};
