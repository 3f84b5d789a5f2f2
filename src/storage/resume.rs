//! Resume data module
//!
//! Durable per-file download checkpoints. A checkpoint that cannot be
//! read or parsed is treated as absent.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::storage::bitmap::PieceBitmap;

/// Extension of checkpoint files
pub const RESUME_EXTENSION: &str = "resume";

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Checkpoint of a partial download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// File content hash
    pub file_hash: String,
    /// Which pieces were downloaded and verified
    pub downloaded_pieces: PieceBitmap,
    /// Where the download is being written
    pub output_path: Option<PathBuf>,
    /// When the checkpoint was written (ms since epoch)
    pub timestamp: u64,
}

impl ResumeCheckpoint {
    /// Create a new checkpoint stamped with the current time
    pub fn new(file_hash: impl Into<String>, downloaded_pieces: PieceBitmap, output_path: Option<PathBuf>) -> Self {
        Self {
            file_hash: file_hash.into(),
            downloaded_pieces,
            output_path,
            timestamp: now_millis(),
        }
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Directory-backed store of resume checkpoints, one file per file hash
#[derive(Debug, Clone)]
pub struct ResumeStore {
    resume_dir: PathBuf,
}

impl ResumeStore {
    /// Create a new resume store
    pub fn new(resume_dir: PathBuf) -> Self {
        Self { resume_dir }
    }

    /// Directory holding the checkpoints
    pub fn resume_dir(&self) -> &Path {
        &self.resume_dir
    }

    fn resume_file_path(&self, file_hash: &str) -> PathBuf {
        self.resume_dir.join(format!("{}.{}", file_hash, RESUME_EXTENSION))
    }

    /// Persist a checkpoint, replacing any previous one
    pub async fn save(&self, file_hash: &str, bitmap: &PieceBitmap, output_path: Option<&Path>) -> Result<()> {
        let checkpoint = ResumeCheckpoint::new(file_hash, bitmap.clone(), output_path.map(Path::to_path_buf));
        let data = checkpoint.serialize()?;

        fs::create_dir_all(&self.resume_dir).await.map_err(|e| {
            error!("Failed to create resume directory '{}': {}", self.resume_dir.display(), e);
            NodeError::storage_error_full("Failed to create resume directory", self.resume_dir.display().to_string(), e.to_string())
        })?;

        // Write then rename into place
        let path = self.resume_file_path(file_hash);
        let tmp_path = path.with_extension(format!("{}.tmp", RESUME_EXTENSION));
        fs::write(&tmp_path, data).await.map_err(|e| {
            error!("Failed to write checkpoint '{}': {}", tmp_path.display(), e);
            NodeError::storage_error_full("Failed to write checkpoint", tmp_path.display().to_string(), e.to_string())
        })?;
        fs::rename(&tmp_path, &path).await.map_err(|e| {
            error!("Failed to move checkpoint into place '{}': {}", path.display(), e);
            NodeError::storage_error_full("Failed to move checkpoint into place", path.display().to_string(), e.to_string())
        })?;

        debug!("Saved checkpoint for {} ({}/{} pieces)", file_hash, bitmap.count(), bitmap.len());
        Ok(())
    }

    /// Load a checkpoint; unreadable or corrupt checkpoints yield `None`
    pub async fn load(&self, file_hash: &str) -> Option<ResumeCheckpoint> {
        let path = self.resume_file_path(file_hash);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read checkpoint '{}': {}", path.display(), e);
                return None;
            }
        };

        match ResumeCheckpoint::deserialize(&data) {
            Ok(checkpoint) if checkpoint.file_hash == file_hash => Some(checkpoint),
            Ok(checkpoint) => {
                warn!("Checkpoint '{}' belongs to {}, ignoring", path.display(), checkpoint.file_hash);
                None
            }
            Err(e) => {
                warn!("Corrupt checkpoint '{}': {}", path.display(), e);
                None
            }
        }
    }

    /// Check whether a checkpoint file exists
    pub async fn has(&self, file_hash: &str) -> bool {
        fs::try_exists(self.resume_file_path(file_hash)).await.unwrap_or(false)
    }

    /// Delete a checkpoint; a missing checkpoint is not an error
    pub async fn delete(&self, file_hash: &str) -> Result<()> {
        let path = self.resume_file_path(file_hash);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted checkpoint for {}", file_hash);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Failed to delete checkpoint '{}': {}", path.display(), e);
                Err(NodeError::storage_error_full("Failed to delete checkpoint", path.display().to_string(), e.to_string()).into())
            }
        }
    }

    /// File hashes that have a checkpoint, sorted
    pub async fn list_resumable(&self) -> Vec<String> {
        let mut file_hashes = Vec::new();

        let mut entries = match fs::read_dir(&self.resume_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list resume directory '{}': {}", self.resume_dir.display(), e);
                return file_hashes;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == RESUME_EXTENSION) {
                        if let Some(file_hash) = path.file_stem().and_then(|s| s.to_str()) {
                            file_hashes.push(file_hash.to_string());
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while listing '{}': {}", self.resume_dir.display(), e);
                    break;
                }
            }
        }

        file_hashes.sort();
        file_hashes
    }
}

impl Default for ResumeStore {
    fn default() -> Self {
        Self::new(PathBuf::from("resume"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_serialize_round_trip() {
        let bitmap = PieceBitmap::from_indices(10, [0, 3, 9]);
        let checkpoint = ResumeCheckpoint::new("hash", bitmap, Some(PathBuf::from("/tmp/out.bin")));
        let bytes = checkpoint.serialize().unwrap();
        assert_eq!(ResumeCheckpoint::deserialize(&bytes).unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("resume"));
        let bitmap = PieceBitmap::from_indices(4, [1, 2]);
        let output = dir.path().join("out.bin");

        store.save("abc", &bitmap, Some(&output)).await.unwrap();
        assert!(store.has("abc").await);

        let loaded = store.load("abc").await.unwrap();
        assert_eq!(loaded.downloaded_pieces, bitmap);
        assert_eq!(loaded.output_path.as_deref(), Some(output.as_path()));
        assert!(loaded.timestamp > 0);

        store.delete("abc").await.unwrap();
        assert!(!store.has("abc").await);
        assert!(store.load("abc").await.is_none());
        // Deleting twice is fine
        store.delete("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());

        store.save("abc", &PieceBitmap::from_indices(4, [0]), None).await.unwrap();
        store.save("abc", &PieceBitmap::from_indices(4, [0, 3]), None).await.unwrap();

        let loaded = store.load("abc").await.unwrap();
        assert_eq!(loaded.downloaded_pieces.iter_set().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(store.list_resumable().await, vec!["abc"]);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        fs::write(dir.path().join("bad.resume"), b"{not json").await.unwrap();

        assert!(store.has("bad").await);
        assert!(store.load("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_with_short_bitmap_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        let json = br#"{"file_hash":"short","downloaded_pieces":{"len":20,"bits":[255]},"output_path":null,"timestamp":1}"#;
        fs::write(dir.path().join("short.resume"), json).await.unwrap();

        assert!(store.has("short").await);
        assert!(store.load("short").await.is_none());
    }

    #[tokio::test]
    async fn test_list_resumable_filters_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().to_path_buf());
        store.save("b", &PieceBitmap::new(1), None).await.unwrap();
        store.save("a", &PieceBitmap::new(1), None).await.unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").await.unwrap();

        assert_eq!(store.list_resumable().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_list_resumable_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::new(dir.path().join("does-not-exist"));
        assert!(store.list_resumable().await.is_empty());
    }
}
