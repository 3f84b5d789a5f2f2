//! Error types for the share node
//!
//! This module defines the error taxonomy shared by every component
//! of the node: protocol, peer, storage, network, integrity and transport
//! failures.

use std::fmt;

/// Error type for share node operations
#[derive(Debug, Clone)]
pub enum NodeError {
    /// Control protocol or frame codec errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Errors attributed to a specific remote peer
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// File I/O and checkpoint errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors (connect, read, write, timeout)
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Piece hash mismatch
    IntegrityError {
        message: String,
        file_hash: String,
        index: u32,
    },

    /// Piece transfer failed on every available path
    TransportError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },
}

impl NodeError {
    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        NodeError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        NodeError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        NodeError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer id
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        NodeError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        NodeError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        NodeError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        NodeError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        NodeError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        NodeError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        NodeError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new IntegrityError for a single piece
    pub fn piece_integrity_error(message: impl Into<String>, file_hash: impl Into<String>, index: u32) -> Self {
        NodeError::IntegrityError {
            message: message.into(),
            file_hash: file_hash.into(),
            index,
        }
    }

    /// Create a new TransportError
    pub fn transport_error(message: impl Into<String>) -> Self {
        NodeError::TransportError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new TransportError with transfer path ("udp" / "tcp") and source
    pub fn transport_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        NodeError::TransportError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Whether this error is a hash mismatch
    pub fn is_integrity(&self) -> bool {
        matches!(self, NodeError::IntegrityError { .. })
    }

    /// Check whether an `anyhow` error wraps an integrity failure
    pub fn is_integrity_failure(err: &anyhow::Error) -> bool {
        err.downcast_ref::<NodeError>()
            .map(NodeError::is_integrity)
            .unwrap_or(false)
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            NodeError::ProtocolError { source, .. }
            | NodeError::PeerError { source, .. }
            | NodeError::StorageError { source, .. }
            | NodeError::NetworkError { source, .. }
            | NodeError::TransportError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            NodeError::ConfigError { message, .. }
            | NodeError::ValidationError { message, .. }
            | NodeError::IntegrityError { message, .. } => {
                *message = format!("{}: {}", message, ctx);
            }
        }
        self
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::ProtocolError { message, source } => match source {
                Some(s) => write!(f, "Protocol error: {} (source: {})", message, s),
                None => write!(f, "Protocol error: {}", message),
            },
            NodeError::PeerError { message, peer, source } => match (peer, source) {
                (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                (None, None) => write!(f, "Peer error: {}", message),
            },
            NodeError::StorageError { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            NodeError::ConfigError { message, field } => match field {
                Some(field) => write!(f, "Config error: {} (field: {})", message, field),
                None => write!(f, "Config error: {}", message),
            },
            NodeError::NetworkError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
            NodeError::ValidationError { message, field } => match field {
                Some(field) => write!(f, "Validation error: {} (field: {})", message, field),
                None => write!(f, "Validation error: {}", message),
            },
            NodeError::IntegrityError { message, file_hash, index } => {
                write!(f, "Integrity error: {} (file: {}, piece: {})", message, file_hash, index)
            }
            NodeError::TransportError { message, path, source } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "Transport error: {} (path: {}, source: {})", message, p, s),
                (Some(p), None) => write!(f, "Transport error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Transport error: {} (source: {})", message, s),
                (None, None) => write!(f, "Transport error: {}", message),
            },
        }
    }
}

impl std::error::Error for NodeError {}
