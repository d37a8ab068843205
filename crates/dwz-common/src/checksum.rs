//! Checksum utilities for dump files
//!
//! Dumps can be several hundred megabytes, so digests are computed by streaming
//! through a fixed buffer rather than reading whole files into memory.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the lowercase hex SHA-256 digest of a file
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    reader_sha256(&mut file)
}

/// Compute the lowercase hex SHA-256 digest of any readable source
pub fn reader_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
