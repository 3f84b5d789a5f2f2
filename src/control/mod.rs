//! Control protocol module
//!
//! NDJSON request/response exchange between peers.

pub mod client;
pub mod server;

pub use client::{ClientConfig, ControlClient};
pub use server::{dispatch, ControlServer, MessageHandler, ServerConfig};
