//! Storage module
//!
//! Manifests, piece availability, piece I/O and resume checkpoints.

pub mod bitmap;
pub mod file;
pub mod manifest;
pub mod piece;
pub mod resume;

pub use bitmap::PieceBitmap;
pub use file::FileStore;
pub use manifest::{FileManifest, ManifestStore};
pub use piece::{hash_file, is_valid_hash, sha256_hex, Piece};
pub use resume::{ResumeCheckpoint, ResumeStore};
