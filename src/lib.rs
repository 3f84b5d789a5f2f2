//! p2p-share-node
//!
//! Peer-to-peer file distribution: manifests, piece scheduling, NDJSON
//! control protocol, UDP piece transport with TCP fallback, and resume.

pub mod storage;
pub mod scheduler;
pub mod protocol;
pub mod peer;
pub mod control;
pub mod transport;
pub mod controller;
pub mod node;
pub mod cli;
pub mod error;

mod sync;

pub use error::NodeError;

pub use storage::{
    hash_file, is_valid_hash, sha256_hex, FileManifest, FileStore, ManifestStore, Piece, PieceBitmap,
    ResumeCheckpoint, ResumeStore,
};
pub use scheduler::{PieceScheduler, SelectionMode};
pub use protocol::{ControlMessage, Frame, MessageBody, NackReason};
pub use peer::{generate_peer_id, PeerConnection, PeerDirectory, PeerInfo, PeerListener};
pub use control::{ClientConfig, ControlClient, ControlServer, MessageHandler, ServerConfig};
pub use transport::{DataService, DataTransport, LossAction, TransferStats, TransportConfig, TransportHandler};
pub use controller::{
    ChannelListener, Components, ControlEvent, ControlEventListener, Controller, ControllerConfig, DownloadHandle,
    DownloadOutcome, NodeStats,
};
pub use node::{Node, NodeConfig};
pub use cli::{CliArgs, Command, Config, ProgressDisplay};
