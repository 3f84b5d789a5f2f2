//! Control server
//!
//! Accepts control connections and answers one response line per request
//! line. Accepted connections go to a bounded worker pool; when its queue
//! is full the accept loop serves the connection itself, which slows
//! acceptance until capacity frees up.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, trace, warn};

use crate::error::NodeError;
use crate::protocol::{
    write_message, ControlMessage, LineReader, MessageBody, NackReason, MAX_LINE_LENGTH, STATUS_ACKNOWLEDGED,
    STATUS_OK,
};
use crate::storage::manifest::FileManifest;

/// Control server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub bind_host: String,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Idle time before a liveness checkpoint
    pub read_timeout: Duration,
    /// Consecutive idle checkpoints before a connection is reaped (0 = never)
    pub max_idle_checkpoints: u32,
    /// SO_LINGER applied to accepted connections
    pub linger: Duration,
    /// Worker tasks serving connections
    pub workers: usize,
    /// Accepted connections waiting for a worker
    pub queue_capacity: usize,
    /// Longest accepted control line
    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 7000,
            backlog: 50,
            read_timeout: Duration::from_secs(30),
            max_idle_checkpoints: 4,
            linger: Duration::from_secs(5),
            workers: 10,
            queue_capacity: 1000,
            max_line_len: MAX_LINE_LENGTH,
        }
    }
}

/// Callbacks for inbound control messages.
///
/// The server answers Ping, Nack and unexpected replies itself; the
/// handler only sees requests that carry node semantics. A handler error
/// becomes a Nack: `invalid_request` for validation errors and
/// `internal_error` for everything else.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Identity used in replies
    fn local_peer_id(&self) -> &str;

    /// A peer offered a file
    async fn on_offer_file(&self, sender: &str, manifest: &FileManifest) -> Result<()>;

    /// A peer asked for pieces
    async fn on_request_pieces(&self, sender: &str, file_hash: &str, pieces: &[u32]) -> Result<()>;

    /// A peer announced pieces it holds
    async fn on_have(&self, sender: &str, file_hash: &str, pieces: &[u32]) -> Result<()>;

    /// A peer proved it is alive
    async fn on_ping(&self, _sender: &str, _sequence: u64) {}
}

/// Produce the response for one decoded request
pub async fn dispatch(handler: &dyn MessageHandler, message: &ControlMessage) -> ControlMessage {
    let me = handler.local_peer_id();
    let sender = message.peer_id.as_str();

    let outcome = match &message.body {
        MessageBody::Ping { sequence } => {
            handler.on_ping(sender, *sequence).await;
            return ControlMessage::pong(me, *sequence);
        }
        MessageBody::Nack { reason, message: text, .. } => {
            warn!("Peer {} rejected a request ({}): {}", sender, reason, text);
            return ControlMessage::ack(me, STATUS_ACKNOWLEDGED);
        }
        MessageBody::Pong { .. } | MessageBody::Ack { .. } => {
            return ControlMessage::nack(
                me,
                NackReason::InvalidRequest,
                format!("unexpected message type {}", message.message_type()),
            )
            .with_request_context(message);
        }
        MessageBody::OfferFile(manifest) => handler.on_offer_file(sender, manifest).await,
        MessageBody::RequestPieces { file_hash, pieces } => handler.on_request_pieces(sender, file_hash, pieces).await,
        MessageBody::Have { file_hash, pieces } => handler.on_have(sender, file_hash, pieces).await,
    };

    match outcome {
        Ok(()) => ControlMessage::ack(me, STATUS_OK),
        Err(e) => {
            let reason = match e.downcast_ref::<NodeError>() {
                Some(NodeError::ValidationError { .. }) | Some(NodeError::ProtocolError { .. }) => {
                    NackReason::InvalidRequest
                }
                _ => NackReason::InternalError,
            };
            warn!("Failed to handle {} from {}: {}", message.message_type(), sender, e);
            ControlMessage::nack(me, reason, e.to_string()).with_request_context(message)
        }
    }
}

/// State shared by the accept loop and the workers
struct Shared {
    config: ServerConfig,
    handler: Arc<dyn MessageHandler>,
}

type Accepted = (TcpStream, SocketAddr);

/// NDJSON control server
pub struct ControlServer {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    queue: Option<mpsc::Sender<Accepted>>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlServer {
    /// Create a new, not yet listening server
    pub fn new(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared { config, handler }),
            shutdown,
            queue: None,
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    /// Bind, spawn the workers and the accept loop, and return the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let config = &self.shared.config;
        let listener = bind_listener(&config.bind_host, config.port, config.backlog).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel::<Accepted>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&self.shared);
            let shutdown = self.shutdown.subscribe();
            self.tasks.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, shared, shutdown).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.subscribe();
        let queue = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            accept_loop(listener, queue, shared, shutdown).await;
        }));

        info!(
            "Control server listening on {} ({} workers, queue {})",
            local_addr, config.workers, config.queue_capacity
        );
        self.queue = Some(tx);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Signal every loop to stop; open connections close at their next checkpoint
    pub fn stop(&mut self) {
        if self.local_addr.take().is_some() {
            info!("Stopping control server");
        }
        let _ = self.shutdown.send(true);
        self.queue = None;
        self.tasks.clear();
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the server is listening
    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    /// Connections waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.queue
            .as_ref()
            .map(|q| q.max_capacity() - q.capacity())
            .unwrap_or(0)
    }

    /// Whether the waiting queue is more than 80% full
    pub fn is_overloaded(&self) -> bool {
        match &self.queue {
            Some(q) => self.queue_len() * 5 > q.max_capacity() * 4,
            None => false,
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    let target = format!("{}:{}", host, port);
    let addr = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| NodeError::network_error_full("Cannot resolve bind address", target.clone(), "empty lookup"))?;

    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    socket.set_reuseaddr(true)?;
    socket.bind(addr).map_err(|e| {
        error!("Failed to bind control server to {}: {}", addr, e);
        NodeError::network_error_full("Failed to bind control server", addr.to_string(), e.to_string())
    })?;
    Ok(socket.listen(backlog)?)
}

fn configure_stream(stream: &TcpStream, config: &ServerConfig) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_linger(Some(config.linger))?;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<Accepted>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = configure_stream(&stream, &shared.config) {
                    warn!("Failed to configure connection from {}: {}", remote, e);
                }
                match queue.try_send((stream, remote)) {
                    Ok(()) => trace!("Queued connection from {}", remote),
                    Err(TrySendError::Full((stream, remote))) => {
                        warn!("Worker queue full, serving {} on the accept loop", remote);
                        serve_connection(stream, remote, &shared, shutdown.clone()).await;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                error!("Failed to accept control connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Control accept loop stopped");
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Accepted>>>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match next {
            Some((stream, remote)) => {
                trace!("Worker {} serving {}", worker_id, remote);
                serve_connection(stream, remote, &shared, shutdown.clone()).await;
            }
            None => break,
        }
    }
    trace!("Control worker {} stopped", worker_id);
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    shared: &Shared,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = &shared.config;
    let me = shared.handler.local_peer_id().to_string();
    debug!("Serving control connection from {}", remote);

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(BufReader::new(read_half), config.max_line_len);
    let mut idle_checkpoints = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let read = tokio::select! {
            res = timeout(config.read_timeout, reader.read_line()) => res,
            _ = shutdown.changed() => break,
        };

        match read {
            Err(_) => {
                idle_checkpoints += 1;
                trace!("Liveness checkpoint {} for {}", idle_checkpoints, remote);
                if config.max_idle_checkpoints > 0 && idle_checkpoints >= config.max_idle_checkpoints {
                    info!("Reaping idle control connection from {}", remote);
                    break;
                }
            }
            Ok(Ok(None)) => {
                debug!("Control connection from {} closed", remote);
                break;
            }
            Ok(Ok(Some(line))) => {
                idle_checkpoints = 0;
                if line.is_empty() {
                    continue;
                }
                let response = match ControlMessage::decode(&line) {
                    Ok(message) => {
                        debug!("Received {} from {} ({})", message.message_type(), message.peer_id, remote);
                        dispatch(shared.handler.as_ref(), &message).await
                    }
                    Err(e) => {
                        warn!("Malformed control message from {}: {}", remote, e);
                        ControlMessage::nack(&me, NackReason::InvalidRequest, e.to_string())
                    }
                };
                if let Err(e) = write_message(&mut write_half, &response).await {
                    warn!("Failed to reply to {}: {}", remote, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                if matches!(e.downcast_ref::<NodeError>(), Some(NodeError::ProtocolError { .. })) {
                    warn!("Framing error from {}, closing: {}", remote, e);
                    let nack = ControlMessage::nack(&me, NackReason::InvalidRequest, e.to_string());
                    let _ = write_message(&mut write_half, &nack).await;
                } else {
                    debug!("Read error from {}: {}", remote, e);
                }
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::piece::sha256_hex;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct TestHandler {
        fail_have: bool,
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        fn local_peer_id(&self) -> &str {
            "server-node"
        }

        async fn on_offer_file(&self, _sender: &str, manifest: &FileManifest) -> Result<()> {
            manifest.validate()
        }

        async fn on_request_pieces(&self, _sender: &str, _file_hash: &str, _pieces: &[u32]) -> Result<()> {
            Ok(())
        }

        async fn on_have(&self, _sender: &str, _file_hash: &str, _pieces: &[u32]) -> Result<()> {
            if self.fail_have {
                Err(anyhow::anyhow!("disk on fire"))
            } else {
                Ok(())
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            read_timeout: Duration::from_millis(200),
            max_idle_checkpoints: 0,
            ..ServerConfig::default()
        }
    }

    async fn start_server(config: ServerConfig, fail_have: bool) -> (ControlServer, SocketAddr) {
        let mut server = ControlServer::new(config, Arc::new(TestHandler { fail_have }));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                lines: BufReader::new(r).lines(),
                writer: w,
            }
        }

        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn request(&mut self, message: &ControlMessage) -> ControlMessage {
            write_message(&mut self.writer, message).await.unwrap();
            self.reply().await
        }

        async fn reply(&mut self) -> ControlMessage {
            let line = timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            ControlMessage::decode(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_dispatch_ping_pong() {
        let handler = TestHandler { fail_have: false };
        let reply = dispatch(&handler, &ControlMessage::ping("client", 5)).await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 5 });
        assert_eq!(reply.peer_id, "server-node");
    }

    #[tokio::test]
    async fn test_dispatch_replies() {
        let handler = TestHandler { fail_have: true };
        let hash = sha256_hex(b"f");

        let reply = dispatch(&handler, &ControlMessage::request_pieces("c", &hash, vec![1])).await;
        assert_eq!(reply.body, MessageBody::Ack { status: STATUS_OK.to_string() });

        let reply = dispatch(&handler, &ControlMessage::nack("c", NackReason::InternalError, "x")).await;
        assert_eq!(reply.body, MessageBody::Ack { status: STATUS_ACKNOWLEDGED.to_string() });

        let reply = dispatch(&handler, &ControlMessage::pong("c", 1)).await;
        assert!(matches!(reply.body, MessageBody::Nack { reason: NackReason::InvalidRequest, .. }));

        let reply = dispatch(&handler, &ControlMessage::have("c", &hash, vec![0])).await;
        match reply.body {
            MessageBody::Nack { reason, request_type, file_hash, .. } => {
                assert_eq!(reason, NackReason::InternalError);
                assert_eq!(request_type.as_deref(), Some("have"));
                assert_eq!(file_hash, Some(hash));
            }
            other => panic!("expected nack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_invalid_offer() {
        let handler = TestHandler { fail_have: false };
        let mut manifest = FileManifest::from_bytes("a", b"abcdef", 2).unwrap();
        manifest.piece_count = 7;
        let reply = dispatch(&handler, &ControlMessage::offer_file("c", &manifest)).await;
        assert!(matches!(reply.body, MessageBody::Nack { reason: NackReason::InvalidRequest, .. }));
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let (mut server, addr) = start_server(test_config(), false).await;
        let mut client = Client::connect(addr).await;

        let reply = client.request(&ControlMessage::ping("client", 5)).await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 5 });
        assert_eq!(reply.peer_id, "server-node");
        server.stop();
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection_usable() {
        let (_server, addr) = start_server(test_config(), false).await;
        let mut client = Client::connect(addr).await;

        client.send_line("{this is not json").await;
        let reply = client.reply().await;
        assert!(matches!(reply.body, MessageBody::Nack { reason: NackReason::InvalidRequest, .. }));

        client.send_line(r#"{"peer_id":"c","timestamp":1,"message_type":"warp"}"#).await;
        let reply = client.reply().await;
        assert!(matches!(reply.body, MessageBody::Nack { reason: NackReason::InvalidRequest, .. }));

        let reply = client.request(&ControlMessage::ping("client", 6)).await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 6 });
    }

    #[tokio::test]
    async fn test_idle_connection_survives_checkpoints() {
        let (_server, addr) = start_server(test_config(), false).await;
        let mut client = Client::connect(addr).await;

        // Several read timeouts pass without closing the connection
        sleep(Duration::from_millis(700)).await;
        let reply = client.request(&ControlMessage::ping("client", 1)).await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 1 });
    }

    #[tokio::test]
    async fn test_idle_connection_reaped() {
        let config = ServerConfig {
            max_idle_checkpoints: 2,
            read_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (_server, addr) = start_server(config, false).await;
        let mut client = Client::connect(addr).await;

        let closed = timeout(Duration::from_secs(5), client.lines.next_line()).await.unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let (_server, addr) = start_server(test_config(), false).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut r, mut w) = stream.into_split();

        let writer = tokio::spawn(async move {
            let chunk = vec![b'x'; 64 * 1024];
            for _ in 0..20 {
                if w.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            let _ = w.write_all(b"\n").await;
        });

        // The server must close the connection rather than wait for a newline
        let drained = timeout(Duration::from_secs(10), async {
            let mut buf = vec![0u8; 4096];
            loop {
                match r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(drained.is_ok());
        let _ = writer.await;
    }

    #[tokio::test]
    async fn test_backpressure_serves_on_accept_loop() {
        let config = ServerConfig {
            workers: 1,
            queue_capacity: 1,
            ..test_config()
        };
        let (server, addr) = start_server(config, false).await;

        // Occupies the only worker
        let mut first = Client::connect(addr).await;
        first.request(&ControlMessage::ping("first", 1)).await;

        // Waits in the queue
        let mut second = Client::connect(addr).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.queue_len(), 1);
        assert!(server.is_overloaded());

        // Queue full: served inline by the accept loop
        let mut third = Client::connect(addr).await;
        let reply = third.request(&ControlMessage::ping("third", 3)).await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 3 });

        write_message(&mut second.writer, &ControlMessage::ping("second", 2)).await.unwrap();
        assert!(timeout(Duration::from_millis(300), second.lines.next_line()).await.is_err());

        // Freeing the worker lets the queued connection through
        drop(first);
        let reply = second.reply().await;
        assert_eq!(reply.body, MessageBody::Pong { sequence: 2 });
    }
}
