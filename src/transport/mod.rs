//! Data transport module
//!
//! Moves piece bytes between peers: one UDP datagram per piece, with a
//! single retry over a TCP connection to the peer's control port + 1.

pub mod service;
pub mod stats;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Duration;

use crate::peer::PeerInfo;
use crate::storage::piece::Piece;

pub use service::DataService;
pub use stats::{TransferCounters, TransferStats};

/// Data transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind
    pub bind_host: String,
    /// UDP port for piece datagrams
    pub data_port: u16,
    /// Time to wait for a UDP reply
    pub udp_timeout: Duration,
    /// TCP fallback connect timeout
    pub tcp_connect_timeout: Duration,
    /// TCP fallback exchange timeout
    pub tcp_request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            data_port: 7070,
            udp_timeout: Duration::from_secs(2),
            tcp_connect_timeout: Duration::from_secs(5),
            tcp_request_timeout: Duration::from_secs(30),
        }
    }
}

/// Reaction to a UDP loss report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    /// Loss is tolerable
    None,
    /// Ask for the piece again
    Retransmit,
    /// Stop using UDP for the file
    FallbackTcp,
}

impl fmt::Display for LossAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossAction::None => write!(f, "none"),
            LossAction::Retransmit => write!(f, "retransmit"),
            LossAction::FallbackTcp => write!(f, "fallback-tcp"),
        }
    }
}

/// Piece movement between peers.
///
/// Every piece returned by `request_piece` has been verified against its
/// declared hash.
#[async_trait]
pub trait DataTransport: Send + Sync {
    /// Push a piece to a peer
    async fn send_piece(&self, peer: &PeerInfo, piece: &Piece) -> Result<()>;

    /// Fetch one piece from a peer
    async fn request_piece(&self, peer: &PeerInfo, file_hash: &str, index: u32) -> Result<Piece>;

    /// Skip UDP for this file from now on
    fn prefer_tcp(&self, file_hash: &str);

    /// Counter snapshot
    fn stats(&self) -> TransferStats;
}

/// Callbacks from the listening side of the transport
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Local copy of a piece to serve, if held
    async fn provide_piece(&self, file_hash: &str, index: u32) -> Option<Piece>;

    /// A verified piece pushed by a peer
    async fn on_piece_received(&self, piece: Piece);

    /// UDP loss observed for a file
    fn on_loss_alert(&self, file_hash: &str, index: u32, loss_rate: f64) -> LossAction;
}
