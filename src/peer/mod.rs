//! Peer module
//!
//! Known peers and control connections to them.

pub mod connection;
pub mod directory;

pub use connection::PeerConnection;
pub use directory::{generate_peer_id, PeerDirectory, PeerInfo, PeerListener};
