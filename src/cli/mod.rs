//! CLI module
//!
//! Command-line interface for the node binary.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command};
pub use config::Config;
pub use progress::ProgressDisplay;
