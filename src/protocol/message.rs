//! Control protocol messages
//!
//! Every control message is a JSON object carrying the sender's peer id,
//! a millisecond timestamp and a `message_type` discriminator followed by
//! the type-specific fields.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::NodeError;
use crate::storage::manifest::FileManifest;
use crate::storage::resume::now_millis;

/// Acknowledgement status for accepted requests
pub const STATUS_OK: &str = "ok";

/// Acknowledgement status for an inbound Nack
pub const STATUS_ACKNOWLEDGED: &str = "acknowledged";

/// Reason code carried by a Nack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// The request could not be parsed or is not valid here
    InvalidRequest,
    /// The request was valid but handling it failed
    InternalError,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::InvalidRequest => write!(f, "invalid_request"),
            NackReason::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Type-specific part of a control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Advertise a file and its piece layout
    OfferFile(FileManifest),
    /// Ask for a set of pieces
    RequestPieces { file_hash: String, pieces: Vec<u32> },
    /// Announce pieces held by the sender
    Have { file_hash: String, pieces: Vec<u32> },
    /// Negative acknowledgement
    Nack {
        reason: NackReason,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_hash: Option<String>,
    },
    /// Liveness probe
    Ping { sequence: u64 },
    /// Liveness reply echoing the probe's sequence
    Pong { sequence: u64 },
    /// Positive acknowledgement
    Ack { status: String },
}

impl MessageBody {
    /// Wire name of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageBody::OfferFile(_) => "offer_file",
            MessageBody::RequestPieces { .. } => "request_pieces",
            MessageBody::Have { .. } => "have",
            MessageBody::Nack { .. } => "nack",
            MessageBody::Ping { .. } => "ping",
            MessageBody::Pong { .. } => "pong",
            MessageBody::Ack { .. } => "ack",
        }
    }
}

/// A control message with its envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Sender's peer id
    pub peer_id: String,
    /// Sender's local time in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Type-specific content
    #[serde(flatten)]
    pub body: MessageBody,
}

impl ControlMessage {
    /// Create a new message stamped with the current time
    pub fn new(peer_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            peer_id: peer_id.into(),
            timestamp: now_millis(),
            body,
        }
    }

    /// Create an OfferFile message from a manifest
    pub fn offer_file(peer_id: impl Into<String>, manifest: &FileManifest) -> Self {
        Self::new(peer_id, MessageBody::OfferFile(manifest.clone()))
    }

    /// Create a RequestPieces message
    pub fn request_pieces(peer_id: impl Into<String>, file_hash: impl Into<String>, pieces: Vec<u32>) -> Self {
        Self::new(
            peer_id,
            MessageBody::RequestPieces {
                file_hash: file_hash.into(),
                pieces,
            },
        )
    }

    /// Create a Have message
    pub fn have(peer_id: impl Into<String>, file_hash: impl Into<String>, pieces: Vec<u32>) -> Self {
        Self::new(
            peer_id,
            MessageBody::Have {
                file_hash: file_hash.into(),
                pieces,
            },
        )
    }

    /// Create a Nack message
    pub fn nack(peer_id: impl Into<String>, reason: NackReason, message: impl Into<String>) -> Self {
        Self::new(
            peer_id,
            MessageBody::Nack {
                reason,
                message: message.into(),
                request_type: None,
                file_hash: None,
            },
        )
    }

    /// Create a Ping message
    pub fn ping(peer_id: impl Into<String>, sequence: u64) -> Self {
        Self::new(peer_id, MessageBody::Ping { sequence })
    }

    /// Create a Pong message
    pub fn pong(peer_id: impl Into<String>, sequence: u64) -> Self {
        Self::new(peer_id, MessageBody::Pong { sequence })
    }

    /// Create an Ack message
    pub fn ack(peer_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(peer_id, MessageBody::Ack { status: status.into() })
    }

    /// Attach the offending request's type and file to a Nack
    pub fn with_request_context(mut self, request: &ControlMessage) -> Self {
        if let MessageBody::Nack { request_type, file_hash, .. } = &mut self.body {
            *request_type = Some(request.message_type().to_string());
            *file_hash = request.file_hash().map(str::to_string);
        }
        self
    }

    /// Wire name of the message type
    pub fn message_type(&self) -> &'static str {
        self.body.message_type()
    }

    /// File hash the message refers to, if any
    pub fn file_hash(&self) -> Option<&str> {
        match &self.body {
            MessageBody::OfferFile(manifest) => Some(&manifest.file_hash),
            MessageBody::RequestPieces { file_hash, .. } | MessageBody::Have { file_hash, .. } => Some(file_hash),
            MessageBody::Nack { file_hash, .. } => file_hash.as_deref(),
            _ => None,
        }
    }

    /// Encode as a single JSON line (without the trailing newline)
    pub fn encode(&self) -> Result<String> {
        trace!("Encoding {} message", self.message_type());
        serde_json::to_string(self)
            .map_err(|e| NodeError::protocol_error_with_source("Failed to encode control message", e.to_string()).into())
    }

    /// Decode one JSON line
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| NodeError::protocol_error_with_source("Malformed control message", e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_wire_shape() {
        let ping = ControlMessage::ping("node-a", 5);
        let value: serde_json::Value = serde_json::from_str(&ping.encode().unwrap()).unwrap();

        assert_eq!(value["message_type"], "ping");
        assert_eq!(value["sequence"], 5);
        assert_eq!(value["peer_id"], "node-a");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_offer_file_round_trip() {
        let manifest = FileManifest::from_bytes("a.txt", b"hello world", 4).unwrap();
        let offer = ControlMessage::offer_file("node-a", &manifest);
        let line = offer.encode().unwrap();
        assert!(line.contains("\"message_type\":\"offer_file\""));
        assert!(line.contains("\"piece_hashes\""));

        let decoded = ControlMessage::decode(&line).unwrap();
        assert_eq!(decoded, offer);
        assert_eq!(decoded.file_hash(), Some(manifest.file_hash.as_str()));
    }

    #[test]
    fn test_decode_handwritten_request() {
        let line = r#"{"peer_id":"p","timestamp":1,"message_type":"request_pieces","file_hash":"abc","pieces":[3,1]}"#;
        let message = ControlMessage::decode(line).unwrap();
        assert_eq!(
            message.body,
            MessageBody::RequestPieces {
                file_hash: "abc".to_string(),
                pieces: vec![3, 1]
            }
        );
    }

    #[test]
    fn test_nack_wire_shape() {
        let request = ControlMessage::have("p", "abc", vec![1]);
        let nack = ControlMessage::nack("me", NackReason::InvalidRequest, "bad").with_request_context(&request);
        let value: serde_json::Value = serde_json::from_str(&nack.encode().unwrap()).unwrap();

        assert_eq!(value["reason"], "invalid_request");
        assert_eq!(value["request_type"], "have");
        assert_eq!(value["file_hash"], "abc");

        let bare = ControlMessage::nack("me", NackReason::InternalError, "boom");
        let value: serde_json::Value = serde_json::from_str(&bare.encode().unwrap()).unwrap();
        assert_eq!(value["reason"], "internal_error");
        assert!(value.get("request_type").is_none());
    }

    #[test]
    fn test_decode_unknown_type_fails() {
        let line = r#"{"peer_id":"p","timestamp":1,"message_type":"teleport"}"#;
        let err = ControlMessage::decode(line).unwrap_err();
        assert!(err.to_string().contains("Malformed control message"));
    }

    #[test]
    fn test_decode_missing_fields_fails() {
        assert!(ControlMessage::decode(r#"{"peer_id":"p","timestamp":1,"message_type":"ping"}"#).is_err());
        assert!(ControlMessage::decode("not json").is_err());
    }
}
