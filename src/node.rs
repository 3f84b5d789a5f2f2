//! Node assembly
//!
//! Builds every component explicitly and wires them together: stores,
//! scheduler, control client, data service, controller and control
//! server. The TCP fallback listener binds the control port + 1.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::control::{ClientConfig, ControlClient, ControlServer, ServerConfig};
use crate::controller::{Components, Controller, ControllerConfig};
use crate::error::NodeError;
use crate::peer::{generate_peer_id, PeerDirectory, PeerInfo};
use crate::scheduler::PieceScheduler;
use crate::storage::{FileStore, ManifestStore, ResumeStore};
use crate::transport::{DataService, TransportConfig};

/// Everything needed to start a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub peer_id: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub transport: TransportConfig,
    pub controller: ControllerConfig,
    pub resume_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            transport: TransportConfig::default(),
            controller: ControllerConfig::default(),
            resume_dir: PathBuf::from("./resume"),
        }
    }
}

/// A running node
pub struct Node {
    peer_id: String,
    controller: Arc<Controller>,
    data: Arc<DataService>,
    server: ControlServer,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    fallback_addr: SocketAddr,
}

impl Node {
    /// Construct all components and start listening
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let manifests = Arc::new(ManifestStore::new());
        let scheduler = Arc::new(PieceScheduler::new(Arc::clone(&manifests)));
        let client = Arc::new(ControlClient::new(config.peer_id.clone(), config.client.clone()));
        let data = Arc::new(DataService::new(config.transport.clone()));

        let controller = Controller::new(
            config.controller.clone(),
            Components {
                manifests,
                scheduler,
                resume: Arc::new(ResumeStore::new(config.resume_dir.clone())),
                files: Arc::new(FileStore::new()),
                directory: Arc::new(PeerDirectory::new()),
                client,
                transport: data.clone(),
            },
        );
        data.set_handler(&controller);

        let mut server = ControlServer::new(config.server.clone(), controller.clone());
        let control_addr = server.start().await?;
        let fallback_port = control_addr.port().checked_add(1).ok_or_else(|| {
            NodeError::config_error_with_field("Control port leaves no room for the TCP fallback", "port")
        })?;
        let (data_addr, fallback_addr) = match data.start(fallback_port).await {
            Ok(addrs) => addrs,
            Err(e) => {
                server.stop();
                return Err(e);
            }
        };

        info!(
            "Node {} up: control {}, data {}, fallback {}",
            config.peer_id, control_addr, data_addr, fallback_addr
        );
        Ok(Self {
            peer_id: config.peer_id,
            controller,
            data,
            server,
            control_addr,
            data_addr,
            fallback_addr,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        self.controller.directory()
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    pub fn fallback_addr(&self) -> SocketAddr {
        self.fallback_addr
    }

    /// How other nodes should address this one
    pub fn peer_info(&self, host: &str) -> PeerInfo {
        PeerInfo::new(self.peer_id.clone(), host, self.control_addr.port(), self.data_addr.port())
    }

    /// Stop listening; active downloads are cancelled
    pub fn stop(&mut self) {
        for file_hash in self.controller.active_downloads() {
            self.controller.cancel_transfer(&file_hash);
        }
        self.server.stop();
        self.data.stop();
        info!("Node {} stopped", self.peer_id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.data.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ChannelListener, ControlEvent, DownloadOutcome};
    use crate::storage::PieceBitmap;
    use tokio::time::{timeout, Duration};

    fn local_config(peer_id: &str, resume_dir: PathBuf) -> NodeConfig {
        NodeConfig {
            peer_id: peer_id.to_string(),
            server: ServerConfig {
                bind_host: "127.0.0.1".to_string(),
                port: 0,
                ..ServerConfig::default()
            },
            client: ClientConfig {
                retry_base_delay: Duration::from_millis(20),
                ..ClientConfig::default()
            },
            transport: TransportConfig {
                bind_host: "127.0.0.1".to_string(),
                data_port: 0,
                udp_timeout: Duration::from_millis(500),
                ..TransportConfig::default()
            },
            controller: ControllerConfig::default(),
            resume_dir,
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
    }

    async fn pair(dir: &tempfile::TempDir) -> (Node, Node) {
        let seeder = Node::start(local_config("seeder", dir.path().join("seed-resume"))).await.unwrap();
        let leecher = Node::start(local_config("leecher", dir.path().join("leech-resume"))).await.unwrap();
        seeder.directory().add_peer(leecher.peer_info("127.0.0.1"));
        leecher.directory().add_peer(seeder.peer_info("127.0.0.1"));
        (seeder, leecher)
    }

    #[tokio::test]
    async fn test_fallback_listener_follows_control_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::start(local_config("solo", dir.path().join("resume"))).await.unwrap();
        assert_eq!(node.fallback_addr().port(), node.control_addr().port() + 1);
        assert_eq!(node.peer_info("127.0.0.1").fallback_addr(), node.fallback_addr().to_string());
        node.stop();
    }

    #[tokio::test]
    async fn test_share_offer_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let (seeder, leecher) = pair(&dir).await;
        let (listener, mut events) = ChannelListener::channel();
        leecher.controller().events().add_listener(listener);

        let source = dir.path().join("source.bin");
        let data = content(200_000);
        tokio::fs::write(&source, &data).await.unwrap();

        // One piece too large for a datagram exercises the TCP fallback
        let manifest = seeder.controller().share_file(&source, 70_000).await.unwrap();
        assert_eq!(seeder.controller().offer_to_peers(&manifest.file_hash).await.unwrap(), 1);
        assert!(leecher.controller().manifests().has_manifest(&manifest.file_hash));

        let output = dir.path().join("copy.bin");
        let handle = leecher.controller().start_download(&manifest.file_hash, &output).await.unwrap();
        let outcome = timeout(Duration::from_secs(20), handle.wait()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), data);

        let resume = ResumeStore::new(dir.path().join("leech-resume"));
        assert!(!resume.has(&manifest.file_hash).await);

        let mut offered = false;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ControlEvent::FileOffered { peer_id, .. } => offered = peer_id == "seeder",
                ControlEvent::DownloadCompleted { .. } => completed = true,
                _ => {}
            }
        }
        assert!(offered);
        assert!(completed);

        let stats = leecher.controller().stats();
        assert_eq!(stats.complete_files, 1);
        assert_eq!(stats.active_sessions, 0);
        assert!(stats.transfer.fallbacks >= 1);
        assert_eq!(stats.transfer.bytes_received, data.len() as u64);
    }

    #[tokio::test]
    async fn test_resume_fetches_only_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (seeder, leecher) = pair(&dir).await;

        let source = dir.path().join("source.bin");
        let data = content(40_000);
        tokio::fs::write(&source, &data).await.unwrap();
        let manifest = seeder.controller().share_file(&source, 10_000).await.unwrap();
        seeder.controller().offer_to_peers(&manifest.file_hash).await.unwrap();

        // First half already on disk from an earlier run
        let output = dir.path().join("copy.bin");
        let mut partial = data.clone();
        partial[20_000..].fill(0);
        tokio::fs::write(&output, &partial).await.unwrap();
        ResumeStore::new(dir.path().join("leech-resume"))
            .save(&manifest.file_hash, &PieceBitmap::from_indices(4, [0, 1]), Some(&output))
            .await
            .unwrap();

        let handle = leecher.controller().start_download(&manifest.file_hash, &output).await.unwrap();
        let outcome = timeout(Duration::from_secs(20), handle.wait()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Completed);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), data);
        assert_eq!(leecher.controller().stats().transfer.bytes_received, 20_000);
    }

    #[tokio::test]
    async fn test_push_piece_to_downloading_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (seeder, leecher) = pair(&dir).await;

        let source = dir.path().join("source.bin");
        let data = content(3_000);
        tokio::fs::write(&source, &data).await.unwrap();
        let manifest = seeder.controller().share_file(&source, 1_000).await.unwrap();
        seeder.controller().offer_to_peers(&manifest.file_hash).await.unwrap();

        // Pushing to a node without a download is accepted and ignored
        seeder.controller().send_piece("leecher", &manifest.file_hash, 0).await.unwrap();
        assert!(!leecher.controller().manifests().is_piece_available(&manifest.file_hash, 0));
        assert!(seeder.controller().send_piece("nobody", &manifest.file_hash, 0).await.is_err());
    }
}
