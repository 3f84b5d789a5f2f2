//! CLI configuration module
//!
//! Turns parsed arguments into a validated configuration and hands out the
//! per-component config structs.

use crate::cli::args::{CliArgs, Command};
use crate::control::{ClientConfig, ServerConfig};
use crate::controller::ControllerConfig;
use crate::error::NodeError;
use crate::node::NodeConfig;
use crate::peer::{generate_peer_id, PeerInfo};
use crate::protocol::MAX_UDP_PIECE_DATA;
use crate::scheduler::SelectionMode;
use crate::transport::TransportConfig;
use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;

/// Configuration for the node binary
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identity
    pub peer_id: String,
    /// Listen address
    pub bind: String,
    /// Control port
    pub port: u16,
    /// UDP data port
    pub data_port: u16,
    /// Download directory
    pub download_dir: PathBuf,
    /// Manifest directory
    pub shared_dir: PathBuf,
    /// Checkpoint directory
    pub resume_dir: PathBuf,
    /// Piece size for newly shared files
    pub piece_size: u32,
    /// Pieces kept in flight per download
    pub batch_size: usize,
    /// Piece selection for downloads
    pub selection_mode: SelectionMode,
    /// Raw peer specs from the command line
    pub peers: Vec<String>,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let controller = ControllerConfig::default();
        let mut config = Self {
            peer_id: args.peer_id.clone().unwrap_or_else(generate_peer_id),
            bind: args.bind.clone(),
            port: args.port,
            data_port: args.data_port,
            download_dir: args.download_dir.clone(),
            shared_dir: args.shared_dir.clone(),
            resume_dir: args.resume_dir.clone(),
            piece_size: 61_440,
            batch_size: controller.max_in_flight,
            selection_mode: controller.selection_mode,
            peers: Vec::new(),
            verbose: args.verbose,
            quiet: args.quiet,
        };

        match &args.command {
            Command::Share { piece_size, .. } => config.piece_size = *piece_size,
            Command::Serve { peers, piece_size, .. } => {
                config.piece_size = *piece_size;
                config.peers = peers.clone();
            }
            Command::Get { peers, batch_size, sequential, .. } => {
                config.peers = peers.clone();
                config.batch_size = *batch_size;
                if *sequential {
                    config.selection_mode = SelectionMode::Sequential;
                }
            }
            Command::Stat => {}
        }
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(NodeError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.port == u16::MAX {
            return Err(NodeError::config_error_with_field("Port leaves no room for the TCP fallback", "port").into());
        }
        if self.data_port == 0 {
            return Err(NodeError::config_error_with_field("Data port cannot be 0", "data_port").into());
        }
        if self.data_port == self.port {
            return Err(NodeError::config_error_with_field("Data port must differ from the control port", "data_port").into());
        }
        if self.piece_size == 0 {
            return Err(NodeError::config_error_with_field("Piece size must be positive", "piece_size").into());
        }
        if self.batch_size == 0 {
            return Err(NodeError::config_error_with_field("Batch size must be at least 1", "batch_size").into());
        }
        if self.peer_id.is_empty() {
            return Err(NodeError::config_error_with_field("Peer id cannot be empty", "peer_id").into());
        }
        for dir in [&self.download_dir, &self.shared_dir, &self.resume_dir] {
            if dir.as_os_str().is_empty() {
                return Err(NodeError::config_error_with_field("Directory cannot be empty", "dir").into());
            }
        }
        self.parse_peers()?;

        if self.piece_size as usize > MAX_UDP_PIECE_DATA {
            warn!(
                "Piece size {} exceeds the UDP limit of {} bytes; every transfer will use the TCP fallback",
                self.piece_size, MAX_UDP_PIECE_DATA
            );
        }
        Ok(())
    }

    /// Parse the peer specs
    pub fn parse_peers(&self) -> Result<Vec<PeerInfo>> {
        self.peers
            .iter()
            .map(|spec| spec.parse::<PeerInfo>().map_err(anyhow::Error::from))
            .collect()
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_host: self.bind.clone(),
            port: self.port,
            ..ServerConfig::default()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            bind_host: self.bind.clone(),
            data_port: self.data_port,
            ..TransportConfig::default()
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_in_flight: self.batch_size,
            selection_mode: self.selection_mode,
            ..ControllerConfig::default()
        }
    }

    /// Full node configuration
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            peer_id: self.peer_id.clone(),
            server: self.server_config(),
            client: self.client_config(),
            transport: self.transport_config(),
            controller: self.controller_config(),
            resume_dir: self.resume_dir.clone(),
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(argv: &[&str]) -> Config {
        let mut full = vec!["p2p-share-node"];
        full.extend_from_slice(argv);
        Config::from_args(&CliArgs::try_parse_from(full).unwrap())
    }

    #[test]
    fn test_config_from_args() {
        let config = parse(&[
            "--port",
            "7100",
            "--peer-id",
            "me",
            "get",
            "--manifest",
            "m.json",
            "--peer",
            "a@127.0.0.1:7000/7070",
            "--batch-size",
            "8",
            "--sequential",
        ]);

        assert_eq!(config.peer_id, "me");
        assert_eq!(config.port, 7100);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.selection_mode, SelectionMode::Sequential);
        assert_eq!(config.parse_peers().unwrap()[0].data_port, 7070);

        let node = config.node_config();
        assert_eq!(node.server.port, 7100);
        assert_eq!(node.transport.data_port, 7070);
        assert_eq!(node.controller.max_in_flight, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(&["stat"]);
        assert_eq!(config.piece_size, 61_440);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.selection_mode, SelectionMode::RarestFirst);
        assert!(!config.peer_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_rejects() {
        let base = parse(&["stat"]);

        let mut config = base.clone();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.data_port = config.port;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.piece_size = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.peers = vec!["no-at-sign:7000".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_piece_only_warns() {
        let config = parse(&["share", "f.bin", "--piece-size", "1048576"]);
        assert_eq!(config.piece_size, 1_048_576);
        assert!(config.validate().is_ok());
    }
}
