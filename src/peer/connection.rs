//! Peer connection module
//!
//! A control-protocol connection to one remote peer.

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use anyhow::Result;
use tracing::{debug, error, trace, warn};

use crate::error::NodeError;
use crate::peer::PeerInfo;
use crate::protocol::{write_message, ControlMessage, LineReader};

/// An open control connection
#[derive(Debug)]
pub struct PeerConnection {
    /// Remote peer
    pub peer: PeerInfo,
    reader: LineReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    request_timeout: Duration,
}

impl PeerConnection {
    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, peer: PeerInfo, request_timeout: Duration, max_line_len: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            peer,
            reader: LineReader::new(BufReader::new(read_half), max_line_len),
            writer: write_half,
            request_timeout,
        }
    }

    /// Connect to a peer's control port
    pub async fn connect(
        peer: &PeerInfo,
        connect_timeout: Duration,
        request_timeout: Duration,
        max_line_len: usize,
    ) -> Result<Self> {
        let addr = peer.control_addr();
        debug!("Connecting to peer {} at {}", peer.id, addr);

        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                NodeError::network_error_full("Connection timeout", addr.clone(), e.to_string())
            })?
            .map_err(|e| {
                error!("Failed to connect to {}: {}", addr, e);
                NodeError::network_error_full("Failed to connect", addr.clone(), e.to_string())
            })?;
        stream.set_nodelay(true)?;

        debug!("Connected to peer {} at {}", peer.id, addr);
        Ok(Self::from_stream(stream, peer.clone(), request_timeout, max_line_len))
    }

    /// Send a message without waiting for a reply
    pub async fn send_message(&mut self, message: &ControlMessage) -> Result<()> {
        trace!("Sending {} to peer {}", message.message_type(), self.peer.id);
        write_message(&mut self.writer, message).await.map_err(|e| {
            error!("Failed to send {} to {}: {}", message.message_type(), self.peer.id, e);
            NodeError::peer_error_with_peer(format!("Failed to send message: {}", e), self.peer.id.clone()).into()
        })
    }

    /// Receive one message, bounded by the request timeout
    pub async fn receive_message(&mut self) -> Result<ControlMessage> {
        let message = timeout(self.request_timeout, self.reader.read_message())
            .await
            .map_err(|_| {
                warn!("Receive timeout from peer {}", self.peer.id);
                NodeError::peer_error_with_peer("Receive message timeout", self.peer.id.clone())
            })??;

        match message {
            Some(message) => {
                trace!("Received {} from peer {}", message.message_type(), self.peer.id);
                Ok(message)
            }
            None => Err(NodeError::peer_error_with_peer("Connection closed by peer", self.peer.id.clone()).into()),
        }
    }

    /// Send a message and wait for its reply
    pub async fn request(&mut self, message: &ControlMessage) -> Result<ControlMessage> {
        self.send_message(message).await?;
        self.receive_message().await
    }

    /// Shut down the write side
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Error closing connection to {}: {}", self.peer.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let ping = ControlMessage::decode(&line).unwrap();
            assert_eq!(ping.message_type(), "ping");
            write_message(&mut write_half, &ControlMessage::pong("server", 1)).await.unwrap();
        });

        let peer = PeerInfo::new("server", "127.0.0.1", port, port);
        let mut conn = PeerConnection::connect(&peer, Duration::from_secs(2), Duration::from_secs(2), 1024)
            .await
            .unwrap();
        let reply = conn.request(&ControlMessage::ping("client", 1)).await.unwrap();
        assert_eq!(reply.peer_id, "server");
        server.await.unwrap();

        // Server side closed
        assert!(conn.receive_message().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerInfo::new("gone", "127.0.0.1", port, port);
        let result = PeerConnection::connect(&peer, Duration::from_secs(1), Duration::from_secs(1), 1024).await;
        assert!(result.is_err());
    }
}
