//! File storage module
//!
//! Maps file hashes to their location on disk and reads/writes pieces at
//! their byte offsets.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::storage::manifest::FileManifest;
use crate::sync;

/// Piece-addressed access to shared and downloading files
#[derive(Debug, Default)]
pub struct FileStore {
    paths: RwLock<HashMap<String, PathBuf>>,
}

impl FileStore {
    /// Create a new, empty file store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing file (e.g. a shared source file)
    pub fn register(&self, file_hash: &str, path: PathBuf) {
        debug!("Registering {} at {}", file_hash, path.display());
        sync::write(&self.paths).insert(file_hash.to_string(), path);
    }

    /// Location of a file on disk
    pub fn path_for(&self, file_hash: &str) -> Option<PathBuf> {
        sync::read(&self.paths).get(file_hash).cloned()
    }

    fn require_path(&self, file_hash: &str) -> Result<PathBuf> {
        self.path_for(file_hash).ok_or_else(|| {
            NodeError::storage_error(format!("No storage location registered for {}", file_hash)).into()
        })
    }

    /// Create (or reopen) a download target sized to the manifest and register it.
    /// Existing content is kept so a resumed download can reuse its pieces.
    pub async fn prepare_output(&self, manifest: &FileManifest, path: &Path) -> Result<()> {
        info!("Preparing output file {} ({} bytes)", path.display(), manifest.file_size);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    NodeError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                NodeError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;
        file.set_len(manifest.file_size).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            NodeError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        self.register(&manifest.file_hash, path.to_path_buf());
        Ok(())
    }

    /// Write a piece at its offset
    pub async fn write_piece(&self, manifest: &FileManifest, index: u32, data: &[u8]) -> Result<()> {
        let expected = manifest.piece_length(index).ok_or_else(|| {
            NodeError::validation_error_with_field(format!("Piece index {} out of range", index), "index")
        })?;
        if data.len() != expected as usize {
            return Err(NodeError::validation_error(format!(
                "Piece {} has {} bytes, expected {}",
                index,
                data.len(),
                expected
            ))
            .into());
        }

        let path = self.require_path(&manifest.file_hash)?;
        let mut file = fs::OpenOptions::new().write(true).open(&path).await.map_err(|e| {
            error!("Failed to open '{}' for writing: {}", path.display(), e);
            NodeError::storage_error_full("Failed to open file for writing", path.display().to_string(), e.to_string())
        })?;
        file.seek(SeekFrom::Start(manifest.piece_offset(index))).await?;
        file.write_all(data).await.map_err(|e| {
            error!("Failed to write piece {} to '{}': {}", index, path.display(), e);
            NodeError::storage_error_full(format!("Failed to write piece {}", index), path.display().to_string(), e.to_string())
        })?;
        file.flush().await?;
        debug!("Wrote piece {} ({} bytes) to {}", index, data.len(), path.display());
        Ok(())
    }

    /// Read a piece from its offset
    pub async fn read_piece(&self, manifest: &FileManifest, index: u32) -> Result<Vec<u8>> {
        let length = manifest.piece_length(index).ok_or_else(|| {
            NodeError::validation_error_with_field(format!("Piece index {} out of range", index), "index")
        })?;
        let path = self.require_path(&manifest.file_hash)?;

        let mut file = fs::File::open(&path).await.map_err(|e| {
            NodeError::storage_error_full("Failed to open file for reading", path.display().to_string(), e.to_string())
        })?;
        file.seek(SeekFrom::Start(manifest.piece_offset(index))).await?;
        let mut data = vec![0u8; length as usize];
        file.read_exact(&mut data).await.map_err(|e| {
            NodeError::storage_error_full(format!("Failed to read piece {}", index), path.display().to_string(), e.to_string())
        })?;
        Ok(data)
    }

    /// Read every piece in index order; unreadable pieces are left out of the map
    pub async fn read_all_pieces(&self, manifest: &FileManifest) -> Result<BTreeMap<u32, Vec<u8>>> {
        let mut pieces = BTreeMap::new();
        for index in 0..manifest.piece_count {
            match self.read_piece(manifest, index).await {
                Ok(data) => {
                    pieces.insert(index, data);
                }
                Err(e) => warn!("Could not read piece {} of {}: {}", index, manifest.file_hash, e),
            }
        }
        Ok(pieces)
    }
}
