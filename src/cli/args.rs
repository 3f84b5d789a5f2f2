//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the file sharing node
#[derive(Debug, Parser)]
#[command(name = "p2p-share-node")]
#[command(about = "Peer-to-peer file distribution node", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Control (TCP) port; the TCP fallback listens on this port + 1
    #[arg(short, long, global = true, default_value_t = 7000)]
    pub port: u16,

    /// Data (UDP) port
    #[arg(long, global = true, default_value_t = 7070)]
    pub data_port: u16,

    /// Address to bind listeners on
    #[arg(long, global = true, default_value = "0.0.0.0")]
    pub bind: String,

    /// Directory for downloaded files
    #[arg(long, global = true, value_name = "DIR", default_value = "./downloads")]
    pub download_dir: PathBuf,

    /// Directory for shared manifests
    #[arg(long, global = true, value_name = "DIR", default_value = "./shared")]
    pub shared_dir: PathBuf,

    /// Directory for resume checkpoints
    #[arg(long, global = true, value_name = "DIR", default_value = "./resume")]
    pub resume_dir: PathBuf,

    /// Peer id (random when omitted)
    #[arg(long, global = true)]
    pub peer_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<tracing::Level>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Hash a file and write its manifest into the shared directory
    Share {
        /// File to share
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Piece size in bytes
        #[arg(long, default_value_t = 61_440)]
        piece_size: u32,
    },

    /// Run the node, offering shared files to the given peers
    Serve {
        /// Files to share
        #[arg(long = "share", value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Peers as id@host:port[/data_port]
        #[arg(long = "peer", value_name = "PEER")]
        peers: Vec<String>,

        /// Piece size in bytes
        #[arg(long, default_value_t = 61_440)]
        piece_size: u32,
    },

    /// Download a file described by a manifest
    Get {
        /// Manifest JSON written by `share`
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,

        /// Peers as id@host:port[/data_port]
        #[arg(long = "peer", value_name = "PEER", required = true)]
        peers: Vec<String>,

        /// Output file (defaults to the download directory)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Pieces kept in flight
        #[arg(long, default_value_t = 5)]
        batch_size: usize,

        /// Fetch pieces in index order instead of rarest first
        #[arg(long)]
        sequential: bool,
    },

    /// List manifests and resumable downloads
    Stat,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level; an explicit `--log-level` wins over the flags
    pub fn log_level(&self) -> tracing::Level {
        if let Some(level) = self.log_level {
            level
        } else if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
