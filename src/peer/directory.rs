//! Peer directory
//!
//! In-memory registry of known peers. Membership is supplied from outside
//! (configuration or a discovery service); this module only stores it and
//! notifies listeners.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::storage::resume::now_millis;
use crate::sync;

/// Generate a random peer id (32 hex characters)
pub fn generate_peer_id() -> String {
    let id = hex::encode(rand::random::<[u8; 16]>());
    info!("Generated new peer ID: {}", id);
    id
}

/// A known remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: String,
    /// Host name or IP address
    pub host: String,
    /// Control protocol port
    pub port: u16,
    /// UDP data port
    pub data_port: u16,
    /// Last time the peer was seen (ms since epoch)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create a new peer record, seen now
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, data_port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            data_port,
            last_seen: now_millis(),
        }
    }

    /// `host:port` of the control server
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:data_port` of the UDP data socket
    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }

    /// `host:(port + 1)` of the TCP fallback server
    pub fn fallback_addr(&self) -> String {
        format!("{}:{}", self.host, self.port.wrapping_add(1))
    }

    /// Resolve the UDP data address
    pub async fn resolve_data_addr(&self) -> Result<SocketAddr> {
        let addr = self.data_addr();
        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| NodeError::network_error_full("Failed to resolve peer", addr.clone(), e.to_string()))?
            .next();
        resolved.ok_or_else(|| NodeError::network_error_full("No address for peer", addr, "empty lookup").into())
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Parses `id@host:port` or `id@host:port/data_port`. Without an explicit
/// data port the control port is used for UDP as well.
impl FromStr for PeerInfo {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NodeError::validation_error_with_field(format!("Invalid peer spec '{}'", s), "peer");

        let (id, rest) = s.split_once('@').ok_or_else(invalid)?;
        let (addr, data_port) = match rest.split_once('/') {
            Some((addr, data)) => (addr, Some(data.parse::<u16>().map_err(|_| invalid())?)),
            None => (rest, None),
        };
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if id.is_empty() || host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(PeerInfo::new(id, host, port, data_port.unwrap_or(port)))
    }
}

/// Callbacks for directory membership changes
pub trait PeerListener: Send + Sync {
    /// A peer was added or updated
    fn on_peer_added(&self, _peer: &PeerInfo) -> Result<()> {
        Ok(())
    }

    /// A peer was removed
    fn on_peer_removed(&self, _peer: &PeerInfo) -> Result<()> {
        Ok(())
    }
}

/// Registry of known peers keyed by id
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, PeerInfo>>,
    listeners: RwLock<Vec<Arc<dyn PeerListener>>>,
}

impl PeerDirectory {
    /// Create a new, empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a membership listener
    pub fn add_listener(&self, listener: Arc<dyn PeerListener>) {
        sync::write(&self.listeners).push(listener);
    }

    /// Add or replace a peer
    pub fn add_peer(&self, peer: PeerInfo) {
        let previous = sync::write(&self.peers).insert(peer.id.clone(), peer.clone());
        match previous {
            Some(_) => debug!("Updated peer {}", peer),
            None => info!("Added peer {} (total: {})", peer, self.count()),
        }
        self.notify(|listener| listener.on_peer_added(&peer));
    }

    /// Remove a peer by id
    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        let removed = sync::write(&self.peers).remove(peer_id);
        if let Some(peer) = &removed {
            info!("Removed peer {} (remaining: {})", peer, self.count());
            self.notify(|listener| listener.on_peer_removed(peer));
        }
        removed
    }

    /// Refresh a peer's last-seen time
    pub fn touch(&self, peer_id: &str) -> bool {
        match sync::write(&self.peers).get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Look up a peer
    pub fn get_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        sync::read(&self.peers).get(peer_id).cloned()
    }

    /// All peers, sorted by id
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = sync::read(&self.peers).values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Number of known peers
    pub fn count(&self) -> usize {
        sync::read(&self.peers).len()
    }

    /// Whether a peer is known
    pub fn has_peer(&self, peer_id: &str) -> bool {
        sync::read(&self.peers).contains_key(peer_id)
    }

    fn notify(&self, f: impl Fn(&dyn PeerListener) -> Result<()>) {
        let listeners = sync::read(&self.listeners).clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Peer listener failed: {}", e),
                Err(_) => warn!("Peer listener panicked"),
            }
        }
    }
}

impl fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("peers", &self.count())
            .field("listeners", &sync::read(&self.listeners).len())
            .finish()
    }
}
