//! Piece storage module
//!
//! Pieces and the SHA-256 helpers used for every hash in the node.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{error, trace};

use crate::error::NodeError;

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Compute the lower-case hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream a file from disk and compute its lower-case hex SHA-256
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        error!("Failed to open '{}' for hashing: {}", path.display(), e);
        NodeError::storage_error_full("Failed to open file for hashing", path.display().to_string(), e.to_string())
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check that a string is a 64-character lower-case hex digest
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A single piece of a shared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    /// Content hash of the file this piece belongs to
    pub file_hash: String,
    /// Piece index
    pub index: u32,
    /// Piece data
    pub data: Vec<u8>,
    /// Expected SHA-256 of `data` (hex)
    pub hash: String,
}

impl Piece {
    /// Create a new piece
    pub fn new(file_hash: impl Into<String>, index: u32, data: Vec<u8>, hash: impl Into<String>) -> Self {
        Self {
            file_hash: file_hash.into(),
            index,
            data,
            hash: hash.into(),
        }
    }

    /// Create a piece whose declared hash is computed from its data
    pub fn from_data(file_hash: impl Into<String>, index: u32, data: Vec<u8>) -> Self {
        let hash = sha256_hex(&data);
        Self::new(file_hash, index, data, hash)
    }

    /// Verify the piece hash (hex compare is case-insensitive)
    pub fn verify(&self) -> bool {
        let actual = sha256_hex(&self.data);
        let valid = actual.eq_ignore_ascii_case(&self.hash);
        trace!("Piece {} of {} verification: {}", self.index, self.file_hash, valid);
        valid
    }

    /// Verify the piece and turn a mismatch into an integrity error
    pub fn ensure_valid(&self) -> Result<()> {
        if self.verify() {
            Ok(())
        } else {
            Err(NodeError::piece_integrity_error(
                format!("Piece hash mismatch, expected {}", self.hash),
                self.file_hash.clone(),
                self.index,
            )
            .into())
        }
    }

    /// Size of the piece data in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the piece holds no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
