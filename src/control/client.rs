//! Control client
//!
//! Sends control messages to peers over pooled connections. Requests are
//! retried with exponential backoff; a connection that fails is evicted
//! from the pool and the next attempt dials a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::NodeError;
use crate::peer::{PeerConnection, PeerInfo};
use crate::protocol::{ControlMessage, MessageBody, MAX_LINE_LENGTH};
use crate::storage::manifest::FileManifest;

/// Control client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time to wait for a reply
    pub request_timeout: Duration,
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further retry
    pub retry_base_delay: Duration,
    /// Longest accepted reply line
    pub max_line_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            max_line_len: MAX_LINE_LENGTH,
        }
    }
}

type SharedConnection = Arc<Mutex<PeerConnection>>;

/// Pooled control-protocol client
pub struct ControlClient {
    local_peer_id: String,
    config: ClientConfig,
    connections: Mutex<HashMap<String, SharedConnection>>,
}

impl ControlClient {
    /// Create a client that signs messages with `local_peer_id`
    pub fn new(local_peer_id: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Identity used in outgoing messages
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Send a request and wait for its reply, retrying on failure
    pub async fn send_and_receive(&self, peer: &PeerInfo, message: &ControlMessage) -> Result<ControlMessage> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let e = match self.try_request(peer, message).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            if attempt >= self.config.max_attempts.max(1) {
                error!(
                    "{} to {} failed after {} attempts: {}",
                    message.message_type(),
                    peer.id,
                    attempt,
                    e
                );
                let context = format!("{} failed after {} attempts", message.message_type(), attempt);
                let err = match e.downcast::<NodeError>() {
                    Ok(e) => e.with_context(context),
                    Err(e) => NodeError::network_error_full(context, peer.control_addr(), e.to_string()),
                };
                return Err(err.into());
            }
            let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(
                "{} to {} failed (attempt {}), retrying in {:?}: {}",
                message.message_type(),
                peer.id,
                attempt,
                delay,
                e
            );
            sleep(delay).await;
        }
    }

    /// Send a message on a short-lived connection without waiting for the caller
    pub fn send_async(&self, peer: &PeerInfo, message: ControlMessage) -> JoinHandle<()> {
        let peer = peer.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let result = async {
                let mut conn = PeerConnection::connect(
                    &peer,
                    config.connect_timeout,
                    config.request_timeout,
                    config.max_line_len,
                )
                .await?;
                let reply = conn.request(&message).await;
                conn.close().await;
                reply
            }
            .await;
            match result {
                Ok(reply) => trace!("{} to {} answered with {}", message.message_type(), peer.id, reply.message_type()),
                Err(e) => debug!("Fire-and-forget {} to {} failed: {}", message.message_type(), peer.id, e),
            }
        })
    }

    /// Round-trip a Ping and return the elapsed time
    pub async fn ping(&self, peer: &PeerInfo, sequence: u64) -> Result<Duration> {
        let started = Instant::now();
        let reply = self
            .send_and_receive(peer, &ControlMessage::ping(&self.local_peer_id, sequence))
            .await?;
        match reply.body {
            MessageBody::Pong { sequence: echoed } if echoed == sequence => {
                let rtt = started.elapsed();
                trace!("Pong {} from {} in {:?}", sequence, peer.id, rtt);
                Ok(rtt)
            }
            other => Err(NodeError::protocol_error_with_source(
                format!("Unexpected reply to ping {}", sequence),
                other.message_type(),
            )
            .into()),
        }
    }

    /// Offer a file's manifest to a peer
    pub async fn send_offer_file(&self, peer: &PeerInfo, manifest: &FileManifest) -> Result<()> {
        info!("Offering {} ({}) to {}", manifest.file_name, manifest.file_hash, peer.id);
        let reply = self
            .send_and_receive(peer, &ControlMessage::offer_file(&self.local_peer_id, manifest))
            .await?;
        expect_ack(peer, reply)
    }

    /// Ask a peer for pieces
    pub async fn send_request_pieces(&self, peer: &PeerInfo, file_hash: &str, pieces: Vec<u32>) -> Result<()> {
        debug!("Requesting {} pieces of {} from {}", pieces.len(), file_hash, peer.id);
        let reply = self
            .send_and_receive(peer, &ControlMessage::request_pieces(&self.local_peer_id, file_hash, pieces))
            .await?;
        expect_ack(peer, reply)
    }

    /// Announce held pieces to a peer
    pub fn send_have(&self, peer: &PeerInfo, file_hash: &str, pieces: Vec<u32>) -> JoinHandle<()> {
        self.send_async(peer, ControlMessage::have(&self.local_peer_id, file_hash, pieces))
    }

    /// Pooled connections
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close and drop every pooled connection
    pub async fn close_all(&self) {
        let drained: Vec<SharedConnection> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        debug!("Closing {} control connections", drained.len());
        for conn in drained {
            conn.lock().await.close().await;
        }
    }

    async fn try_request(&self, peer: &PeerInfo, message: &ControlMessage) -> Result<ControlMessage> {
        let conn = self.connection(peer).await?;
        let reply = conn.lock().await.request(message).await;
        if reply.is_err() {
            self.evict(&peer.id, &conn).await;
        }
        reply
    }

    async fn connection(&self, peer: &PeerInfo) -> Result<SharedConnection> {
        if let Some(conn) = self.connections.lock().await.get(&peer.id) {
            return Ok(Arc::clone(conn));
        }

        let conn = PeerConnection::connect(
            peer,
            self.config.connect_timeout,
            self.config.request_timeout,
            self.config.max_line_len,
        )
        .await?;
        let mut connections = self.connections.lock().await;
        let conn = connections
            .entry(peer.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(conn)));
        Ok(Arc::clone(conn))
    }

    /// Drop `failed` from the pool unless it was already replaced
    async fn evict(&self, peer_id: &str, failed: &SharedConnection) {
        let mut connections = self.connections.lock().await;
        if connections.get(peer_id).is_some_and(|current| Arc::ptr_eq(current, failed)) {
            connections.remove(peer_id);
            debug!("Evicted control connection to {}", peer_id);
        }
    }
}

fn expect_ack(peer: &PeerInfo, reply: ControlMessage) -> Result<()> {
    match reply.body {
        MessageBody::Ack { .. } => Ok(()),
        MessageBody::Nack { reason, message, .. } => {
            Err(NodeError::peer_error_with_peer(format!("Rejected ({}): {}", reason, message), peer.id.clone()).into())
        }
        other => Err(NodeError::protocol_error_with_source("Expected ack", other.message_type()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::server::{ControlServer, MessageHandler, ServerConfig};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        haves: StdMutex<Vec<(String, Vec<u32>)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        fn local_peer_id(&self) -> &str {
            "remote"
        }

        async fn on_offer_file(&self, _sender: &str, manifest: &FileManifest) -> Result<()> {
            manifest.validate()
        }

        async fn on_request_pieces(&self, _sender: &str, _file_hash: &str, _pieces: &[u32]) -> Result<()> {
            Ok(())
        }

        async fn on_have(&self, sender: &str, _file_hash: &str, pieces: &[u32]) -> Result<()> {
            self.haves.lock().unwrap().push((sender.to_string(), pieces.to_vec()));
            Ok(())
        }
    }

    fn server_config(port: u16) -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            port,
            read_timeout: Duration::from_millis(200),
            max_idle_checkpoints: 0,
            ..ServerConfig::default()
        }
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            retry_base_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ping_echoes_sequence() {
        let mut server = ControlServer::new(server_config(0), Arc::new(RecordingHandler::default()));
        let addr = server.start().await.unwrap();
        let peer = PeerInfo::new("remote", "127.0.0.1", addr.port(), addr.port());

        let client = ControlClient::new("local", client_config());
        client.ping(&peer, 5).await.unwrap();
        client.ping(&peer, 6).await.unwrap();
        assert_eq!(client.connection_count().await, 1);

        client.close_all().await;
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_rejected_surfaces_error() {
        let mut server = ControlServer::new(server_config(0), Arc::new(RecordingHandler::default()));
        let addr = server.start().await.unwrap();
        let peer = PeerInfo::new("remote", "127.0.0.1", addr.port(), addr.port());
        let client = ControlClient::new("local", client_config());

        let manifest = FileManifest::from_bytes("ok.bin", b"hello world", 4).unwrap();
        client.send_offer_file(&peer, &manifest).await.unwrap();

        let mut bad = manifest.clone();
        bad.piece_hashes.pop();
        let err = client.send_offer_file(&peer, &bad).await.unwrap_err();
        assert!(err.to_string().contains("invalid_request"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_exhausts_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerInfo::new("gone", "127.0.0.1", port, port);
        let client = ControlClient::new("local", client_config());

        let started = Instant::now();
        let err = client.ping(&peer, 1).await.unwrap_err();
        // Two backoff sleeps: 20ms + 40ms
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(matches!(err.downcast_ref::<NodeError>(), Some(NodeError::NetworkError { .. })));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_connection_is_replaced() {
        let handler = Arc::new(RecordingHandler::default());
        let mut server = ControlServer::new(server_config(0), handler.clone());
        let addr = server.start().await.unwrap();
        let peer = PeerInfo::new("remote", "127.0.0.1", addr.port(), addr.port());

        let client = ControlClient::new("local", client_config());
        client.ping(&peer, 1).await.unwrap();

        server.stop();
        sleep(Duration::from_millis(300)).await;
        let mut restarted = ControlServer::new(server_config(addr.port()), handler);
        restarted.start().await.unwrap();

        // The pooled connection is dead; a retry dials the new server
        client.ping(&peer, 2).await.unwrap();
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_evict_replacement() {
        let mut server = ControlServer::new(server_config(0), Arc::new(RecordingHandler::default()));
        let addr = server.start().await.unwrap();
        let peer = PeerInfo::new("remote", "127.0.0.1", addr.port(), addr.port());

        let client = ControlClient::new("local", client_config());
        client.ping(&peer, 1).await.unwrap();
        let pooled = client.connection(&peer).await.unwrap();

        // A request that failed on an older connection must leave the pooled one alone
        let stale = PeerConnection::connect(&peer, Duration::from_secs(1), Duration::from_secs(1), MAX_LINE_LENGTH)
            .await
            .unwrap();
        let stale: SharedConnection = Arc::new(Mutex::new(stale));
        client.evict(&peer.id, &stale).await;
        assert_eq!(client.connection_count().await, 1);
        assert!(Arc::ptr_eq(&client.connection(&peer).await.unwrap(), &pooled));

        client.evict(&peer.id, &pooled).await;
        assert_eq!(client.connection_count().await, 0);
        client.ping(&peer, 2).await.unwrap();
        assert!(!Arc::ptr_eq(&client.connection(&peer).await.unwrap(), &pooled));
    }

    #[tokio::test]
    async fn test_send_have_is_fire_and_forget() {
        let handler = Arc::new(RecordingHandler::default());
        let mut server = ControlServer::new(server_config(0), handler.clone());
        let addr = server.start().await.unwrap();
        let peer = PeerInfo::new("remote", "127.0.0.1", addr.port(), addr.port());

        let client = ControlClient::new("local", client_config());
        client.send_have(&peer, "abc", vec![0, 2]).await.unwrap();

        let haves = handler.haves.lock().unwrap().clone();
        assert_eq!(haves, vec![("local".to_string(), vec![0, 2])]);
        assert_eq!(client.connection_count().await, 0);
    }
}
