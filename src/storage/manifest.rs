//! Manifest store
//!
//! File manifests, per-file piece availability and the index of peers
//! known to hold each file. Every file hash has its own lock so that
//! updates to one file never wait on another.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, trace, warn};

use crate::error::NodeError;
use crate::storage::bitmap::PieceBitmap;
use crate::storage::piece::{is_valid_hash, sha256_hex};
use crate::sync;

/// Metadata describing a shared file's identity and piece layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// SHA-256 of the whole file (hex)
    pub file_hash: String,
    /// File name
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// Size of every piece except possibly the last
    pub piece_size: u32,
    /// Number of pieces
    pub piece_count: u32,
    /// Per-piece SHA-256 hashes (hex), in index order
    pub piece_hashes: Vec<String>,
}

impl FileManifest {
    /// Create a new manifest, checking the piece layout invariants
    pub fn new(
        file_hash: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        piece_size: u32,
        piece_hashes: Vec<String>,
    ) -> Result<Self> {
        let manifest = Self {
            file_hash: file_hash.into(),
            file_name: file_name.into(),
            file_size,
            piece_size,
            piece_count: piece_hashes.len() as u32,
            piece_hashes,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Number of pieces for a file of `file_size` bytes, `None` when it
    /// does not fit in a `u32`
    pub fn expected_piece_count(file_size: u64, piece_size: u32) -> Option<u32> {
        if piece_size == 0 {
            return Some(0);
        }
        u32::try_from(file_size.div_ceil(piece_size as u64)).ok()
    }

    /// Check the layout invariants and hash formats
    pub fn validate(&self) -> Result<()> {
        if self.piece_size == 0 {
            return Err(NodeError::validation_error_with_field("Piece size must be positive", "piece_size").into());
        }
        if !is_valid_hash(&self.file_hash) {
            return Err(NodeError::validation_error_with_field(
                format!("Invalid file hash '{}'", self.file_hash),
                "file_hash",
            )
            .into());
        }
        let Some(expected) = Self::expected_piece_count(self.file_size, self.piece_size) else {
            return Err(NodeError::validation_error_with_field(
                format!("File of {} bytes has too many pieces of {}", self.file_size, self.piece_size),
                "piece_size",
            )
            .into());
        };
        if self.piece_count != expected {
            return Err(NodeError::validation_error_with_field(
                format!("Piece count {} does not match ceil({}/{}) = {}", self.piece_count, self.file_size, self.piece_size, expected),
                "piece_count",
            )
            .into());
        }
        if self.piece_hashes.len() != self.piece_count as usize {
            return Err(NodeError::validation_error_with_field(
                format!("Expected {} piece hashes, got {}", self.piece_count, self.piece_hashes.len()),
                "piece_hashes",
            )
            .into());
        }
        if let Some(bad) = self.piece_hashes.iter().position(|h| !is_valid_hash(&h.to_ascii_lowercase())) {
            return Err(NodeError::validation_error_with_field(
                format!("Invalid hash for piece {}", bad),
                "piece_hashes",
            )
            .into());
        }
        Ok(())
    }

    /// Build a manifest from in-memory content
    pub fn from_bytes(file_name: impl Into<String>, data: &[u8], piece_size: u32) -> Result<Self> {
        if piece_size == 0 {
            return Err(NodeError::validation_error_with_field("Piece size must be positive", "piece_size").into());
        }
        let piece_hashes = data
            .chunks(piece_size as usize)
            .map(sha256_hex)
            .collect::<Vec<_>>();
        Self::new(sha256_hex(data), file_name, data.len() as u64, piece_size, piece_hashes)
    }

    /// Build a manifest by streaming a file from disk once
    pub async fn from_path(path: &Path, piece_size: u32) -> Result<Self> {
        if piece_size == 0 {
            return Err(NodeError::validation_error_with_field("Piece size must be positive", "piece_size").into());
        }
        info!("Computing manifest for {}", path.display());

        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            error!("Failed to open '{}': {}", path.display(), e);
            NodeError::storage_error_full("Failed to open file", path.display().to_string(), e.to_string())
        })?;

        let mut file_hasher = Sha256::new();
        let mut piece_hashes = Vec::new();
        let mut file_size = 0u64;
        let mut buf = vec![0u8; piece_size as usize];

        loop {
            // Fill one whole piece, or whatever remains before EOF
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            file_hasher.update(&buf[..filled]);
            piece_hashes.push(sha256_hex(&buf[..filled]));
            file_size += filled as u64;
            if filled < buf.len() {
                break;
            }
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let manifest = Self::new(hex::encode(file_hasher.finalize()), file_name, file_size, piece_size, piece_hashes)?;
        debug!("Manifest for {}: {} bytes in {} pieces", path.display(), manifest.file_size, manifest.piece_count);
        Ok(manifest)
    }

    /// Length of the piece at `index`; the last piece may be short
    pub fn piece_length(&self, index: u32) -> Option<u32> {
        if index >= self.piece_count {
            return None;
        }
        let offset = self.piece_offset(index);
        Some((self.file_size - offset).min(self.piece_size as u64) as u32)
    }

    /// Byte offset of the piece at `index`
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size as u64
    }

    /// Expected hash of the piece at `index`
    pub fn piece_hash(&self, index: u32) -> Option<&str> {
        self.piece_hashes.get(index as usize).map(String::as_str)
    }
}

/// Per-file state behind its own lock
#[derive(Debug)]
struct FileEntry {
    manifest: Arc<FileManifest>,
    availability: RwLock<PieceBitmap>,
}

/// Store of manifests, availability bitmaps and peer-file associations
#[derive(Debug, Default)]
pub struct ManifestStore {
    files: RwLock<HashMap<String, Arc<FileEntry>>>,
    peers: RwLock<HashMap<String, Arc<RwLock<BTreeSet<String>>>>>,
}

impl ManifestStore {
    /// Create a new, empty manifest store
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, file_hash: &str) -> Option<Arc<FileEntry>> {
        sync::read(&self.files).get(file_hash).cloned()
    }

    /// Add a manifest. Manifests are immutable: returns false and keeps
    /// the existing one when the hash is already known.
    pub fn add_manifest(&self, manifest: FileManifest) -> bool {
        let mut files = sync::write(&self.files);
        if files.contains_key(&manifest.file_hash) {
            debug!("Manifest {} already known", manifest.file_hash);
            return false;
        }
        info!(
            "Adding manifest {} ({}, {} bytes, {} pieces)",
            manifest.file_hash, manifest.file_name, manifest.file_size, manifest.piece_count
        );
        let entry = FileEntry {
            availability: RwLock::new(PieceBitmap::new(manifest.piece_count)),
            manifest: Arc::new(manifest),
        };
        files.insert(entry.manifest.file_hash.clone(), Arc::new(entry));
        true
    }

    /// Get a manifest
    pub fn get_manifest(&self, file_hash: &str) -> Option<Arc<FileManifest>> {
        self.entry(file_hash).map(|e| Arc::clone(&e.manifest))
    }

    /// Check whether a manifest is known
    pub fn has_manifest(&self, file_hash: &str) -> bool {
        sync::read(&self.files).contains_key(file_hash)
    }

    /// All known file hashes, sorted
    pub fn file_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = sync::read(&self.files).keys().cloned().collect();
        hashes.sort();
        hashes
    }

    /// Record that a peer advertised a file; returns true if newly recorded
    pub fn register_peer_for_file(&self, file_hash: &str, peer_id: &str) -> bool {
        let existing = sync::read(&self.peers).get(file_hash).cloned();
        let set = match existing {
            Some(set) => set,
            None => Arc::clone(
                sync::write(&self.peers)
                    .entry(file_hash.to_string())
                    .or_default(),
            ),
        };
        let added = sync::write(&set).insert(peer_id.to_string());
        if added {
            debug!("Peer {} holds file {}", peer_id, file_hash);
        }
        added
    }

    /// Peers known to hold a file
    pub fn peers_for_file(&self, file_hash: &str) -> Vec<String> {
        sync::read(&self.peers)
            .get(file_hash)
            .map(|set| sync::read(set).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark a piece as held locally. Returns `Ok(true)` if the bit was
    /// newly set and `Ok(false)` if it was already set.
    pub fn mark_piece_available(&self, file_hash: &str, index: u32) -> Result<bool> {
        let entry = self.entry(file_hash).ok_or_else(|| {
            warn!("Cannot mark piece {} available: unknown file {}", index, file_hash);
            NodeError::validation_error_with_field(format!("Unknown file {}", file_hash), "file_hash")
        })?;
        if index >= entry.manifest.piece_count {
            return Err(NodeError::validation_error_with_field(
                format!("Piece index {} out of range ({} pieces)", index, entry.manifest.piece_count),
                "index",
            )
            .into());
        }
        let mut availability = sync::write(&entry.availability);
        if availability.get(index) {
            return Ok(false);
        }
        availability.set(index);
        trace!("Piece {} of {} available ({}/{})", index, file_hash, availability.count(), availability.len());
        Ok(true)
    }

    /// Check whether a single piece is held locally
    pub fn is_piece_available(&self, file_hash: &str, index: u32) -> bool {
        self.entry(file_hash)
            .map(|e| sync::read(&e.availability).get(index))
            .unwrap_or(false)
    }

    /// Copy of a file's availability bitmap
    pub fn availability(&self, file_hash: &str) -> Option<PieceBitmap> {
        self.entry(file_hash).map(|e| sync::read(&e.availability).clone())
    }

    /// Missing piece indices in ascending order; empty for unknown files
    pub fn missing_pieces(&self, file_hash: &str) -> Vec<u32> {
        self.entry(file_hash)
            .map(|e| sync::read(&e.availability).iter_missing().collect())
            .unwrap_or_default()
    }

    /// Whether every piece of a known file is held locally
    pub fn is_complete(&self, file_hash: &str) -> bool {
        self.entry(file_hash)
            .map(|e| sync::read(&e.availability).is_complete())
            .unwrap_or(false)
    }

    /// (available, total) piece counts
    pub fn progress(&self, file_hash: &str) -> Option<(u32, u32)> {
        self.entry(file_hash).map(|e| {
            let availability = sync::read(&e.availability);
            (availability.count(), availability.len())
        })
    }

    /// Verify received bytes against the manifest's hash for `index`
    pub fn verify_piece(&self, file_hash: &str, index: u32, data: &[u8]) -> bool {
        let Some(manifest) = self.get_manifest(file_hash) else {
            warn!("Cannot verify piece {}: unknown file {}", index, file_hash);
            return false;
        };
        let Some(expected) = manifest.piece_hash(index) else {
            warn!("Cannot verify piece {} of {}: index out of range", index, file_hash);
            return false;
        };
        let valid = sha256_hex(data).eq_ignore_ascii_case(expected);
        if !valid {
            warn!("Piece {} of {} failed verification", index, file_hash);
        }
        valid
    }

    /// Hash the concatenation of pieces `0..piece_count` in order.
    /// Returns `None` if any index is absent.
    pub fn compute_file_hash(&self, file_hash: &str, pieces: &BTreeMap<u32, Vec<u8>>) -> Option<String> {
        let manifest = self.get_manifest(file_hash)?;
        let mut hasher = Sha256::new();
        for index in 0..manifest.piece_count {
            match pieces.get(&index) {
                Some(data) => hasher.update(data),
                None => {
                    debug!("Piece {} of {} absent, cannot compute file hash", index, file_hash);
                    return None;
                }
            }
        }
        Some(hex::encode(hasher.finalize()))
    }

    /// Compare the reconstructed whole-file hash against the manifest
    pub fn verify_file(&self, file_hash: &str, pieces: &BTreeMap<u32, Vec<u8>>) -> bool {
        match self.compute_file_hash(file_hash, pieces) {
            Some(actual) => actual.eq_ignore_ascii_case(file_hash),
            None => false,
        }
    }

    /// Indices whose bytes are absent or do not match their piece hash
    pub fn find_corrupt_pieces(&self, file_hash: &str, pieces: &BTreeMap<u32, Vec<u8>>) -> Vec<u32> {
        let Some(manifest) = self.get_manifest(file_hash) else {
            return Vec::new();
        };
        (0..manifest.piece_count)
            .filter(|&index| match pieces.get(&index) {
                Some(data) => !self.verify_piece(file_hash, index, data),
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_manifest_piece_layout() {
        let data = sample_data(1_000_000);
        let manifest = FileManifest::from_bytes("big.bin", &data, 262_144).unwrap();

        assert_eq!(manifest.piece_count, 4);
        assert_eq!(manifest.piece_hashes.len(), 4);
        assert_eq!(manifest.piece_length(0), Some(262_144));
        assert_eq!(manifest.piece_length(2), Some(262_144));
        assert_eq!(manifest.piece_length(3), Some(213_568));
        assert_eq!(manifest.piece_length(4), None);
        let total: u64 = (0..manifest.piece_count)
            .map(|i| manifest.piece_length(i).unwrap() as u64)
            .sum();
        assert_eq!(total, manifest.file_size);
        assert_eq!(manifest.file_hash, sha256_hex(&data));
    }

    #[test]
    fn test_expected_piece_count() {
        assert_eq!(FileManifest::expected_piece_count(0, 10), Some(0));
        assert_eq!(FileManifest::expected_piece_count(10, 10), Some(1));
        assert_eq!(FileManifest::expected_piece_count(11, 10), Some(2));
        assert_eq!(FileManifest::expected_piece_count(11, 0), Some(0));
        assert_eq!(FileManifest::expected_piece_count(u32::MAX as u64, 1), Some(u32::MAX));
        assert_eq!(FileManifest::expected_piece_count((1u64 << 32) + 1, 1), None);
    }

    #[test]
    fn test_manifest_rejects_piece_count_overflow() {
        // 2^32 + 1 pieces would wrap to 1 if truncated
        let hashes = vec![sha256_hex(b"a")];
        assert!(FileManifest::new(sha256_hex(b"a"), "f", (1u64 << 32) + 1, 1, hashes.clone()).is_err());

        let json = serde_json::json!({
            "file_hash": sha256_hex(b"a"),
            "file_name": "f",
            "file_size": (1u64 << 32) + 1,
            "piece_size": 1,
            "piece_count": 1,
            "piece_hashes": hashes,
        });
        let manifest: FileManifest = serde_json::from_value(json).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_manifest_rejects_inconsistent_layout() {
        let hashes = vec![sha256_hex(b"a"), sha256_hex(b"b")];
        assert!(FileManifest::new(sha256_hex(b"ab"), "f", 100, 10, hashes.clone()).is_err());
        assert!(FileManifest::new(sha256_hex(b"ab"), "f", 20, 0, hashes.clone()).is_err());
        assert!(FileManifest::new("not-a-hash", "f", 20, 10, hashes.clone()).is_err());
        assert!(FileManifest::new(sha256_hex(b"ab"), "f", 20, 10, hashes).is_ok());
    }

    #[tokio::test]
    async fn test_manifest_from_path_matches_from_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let data = sample_data(100_001);
        tokio::fs::write(&path, &data).await.unwrap();

        let from_path = FileManifest::from_path(&path, 16_384).await.unwrap();
        let from_bytes = FileManifest::from_bytes("file.bin", &data, 16_384).unwrap();
        assert_eq!(from_path, from_bytes);
    }

    #[test]
    fn test_add_manifest_is_immutable() {
        let store = ManifestStore::new();
        let manifest = FileManifest::from_bytes("a", b"hello world", 4).unwrap();
        let hash = manifest.file_hash.clone();

        assert!(store.add_manifest(manifest.clone()));
        store.mark_piece_available(&hash, 1).unwrap();
        assert!(!store.add_manifest(manifest));
        assert!(store.is_piece_available(&hash, 1));
        assert!(store.has_manifest(&hash));
        assert_eq!(store.file_hashes(), vec![hash]);
    }

    #[test]
    fn test_missing_and_available_partition() {
        let store = ManifestStore::new();
        let manifest = FileManifest::from_bytes("a", &sample_data(1_000_000), 262_144).unwrap();
        let hash = manifest.file_hash.clone();
        store.add_manifest(manifest);

        assert_eq!(store.missing_pieces(&hash), vec![0, 1, 2, 3]);
        assert!(!store.is_complete(&hash));

        for index in [2, 0] {
            assert!(store.mark_piece_available(&hash, index).unwrap());
            let missing = store.missing_pieces(&hash);
            let available: Vec<u32> = store.availability(&hash).unwrap().iter_set().collect();
            let mut all: Vec<u32> = missing.iter().chain(available.iter()).copied().collect();
            all.sort();
            assert_eq!(all, vec![0, 1, 2, 3]);
            assert!(missing.iter().all(|i| !available.contains(i)));
        }

        assert!(!store.mark_piece_available(&hash, 0).unwrap());
        store.mark_piece_available(&hash, 1).unwrap();
        store.mark_piece_available(&hash, 3).unwrap();
        assert!(store.is_complete(&hash));
        assert_eq!(store.progress(&hash), Some((4, 4)));
    }

    #[test]
    fn test_mark_piece_available_errors() {
        let store = ManifestStore::new();
        assert!(store.mark_piece_available(&sha256_hex(b"x"), 0).is_err());

        let manifest = FileManifest::from_bytes("a", b"abcdef", 3).unwrap();
        let hash = manifest.file_hash.clone();
        store.add_manifest(manifest);
        assert!(store.mark_piece_available(&hash, 2).is_err());
    }

    #[test]
    fn test_availability_is_a_snapshot() {
        let store = ManifestStore::new();
        let manifest = FileManifest::from_bytes("a", b"abcdef", 3).unwrap();
        let hash = manifest.file_hash.clone();
        store.add_manifest(manifest);

        let before = store.availability(&hash).unwrap();
        store.mark_piece_available(&hash, 0).unwrap();
        assert!(!before.get(0));
        assert!(store.availability(&hash).unwrap().get(0));
    }

    #[test]
    fn test_unknown_file_queries() {
        let store = ManifestStore::new();
        let hash = sha256_hex(b"unknown");
        assert!(store.missing_pieces(&hash).is_empty());
        assert!(!store.is_complete(&hash));
        assert!(store.availability(&hash).is_none());
        assert!(!store.verify_piece(&hash, 0, b"data"));
    }

    #[test]
    fn test_register_peer_for_file() {
        let store = ManifestStore::new();
        let hash = sha256_hex(b"f");
        assert!(store.register_peer_for_file(&hash, "peer-b"));
        assert!(store.register_peer_for_file(&hash, "peer-a"));
        assert!(!store.register_peer_for_file(&hash, "peer-a"));
        assert_eq!(store.peers_for_file(&hash), vec!["peer-a", "peer-b"]);
        assert!(store.peers_for_file(&sha256_hex(b"g")).is_empty());
    }

    #[test]
    fn test_verify_piece_and_file() {
        let data = sample_data(10_000);
        let manifest = FileManifest::from_bytes("a", &data, 4096).unwrap();
        let hash = manifest.file_hash.clone();
        let store = ManifestStore::new();
        store.add_manifest(manifest);

        let mut pieces: BTreeMap<u32, Vec<u8>> = data
            .chunks(4096)
            .enumerate()
            .map(|(i, c)| (i as u32, c.to_vec()))
            .collect();

        assert!(store.verify_piece(&hash, 1, &pieces[&1]));
        assert!(!store.verify_piece(&hash, 1, &pieces[&0]));
        assert_eq!(store.compute_file_hash(&hash, &pieces), Some(hash.clone()));
        assert!(store.verify_file(&hash, &pieces));
        assert!(store.find_corrupt_pieces(&hash, &pieces).is_empty());

        pieces.get_mut(&2).unwrap()[0] ^= 0xff;
        assert!(!store.verify_file(&hash, &pieces));
        assert_eq!(store.find_corrupt_pieces(&hash, &pieces), vec![2]);

        pieces.remove(&1);
        assert_eq!(store.compute_file_hash(&hash, &pieces), None);
        assert_eq!(store.find_corrupt_pieces(&hash, &pieces), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_marks_on_different_files() {
        let store = Arc::new(ManifestStore::new());
        let manifests: Vec<FileManifest> = (0..4)
            .map(|i| FileManifest::from_bytes(format!("f{}", i), &sample_data(1000 + i), 10).unwrap())
            .collect();
        for m in &manifests {
            store.add_manifest(m.clone());
        }

        let handles: Vec<_> = manifests
            .iter()
            .map(|m| {
                let store = Arc::clone(&store);
                let hash = m.file_hash.clone();
                let count = m.piece_count;
                std::thread::spawn(move || {
                    for index in 0..count {
                        store.mark_piece_available(&hash, index).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for m in &manifests {
            assert!(store.is_complete(&m.file_hash));
        }
    }
}
