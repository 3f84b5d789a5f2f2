//! Data service
//!
//! UDP socket and TCP fallback listener for piece frames. Outbound
//! requests wait on a oneshot keyed by (file hash, index) that the UDP
//! receive loop completes when the matching PIECE or ERROR arrives.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::NodeError;
use crate::peer::PeerInfo;
use crate::protocol::{read_frame, write_frame, Frame, MAX_UDP_PAYLOAD};
use crate::storage::piece::Piece;
use crate::sync;
use crate::transport::stats::{LossTracker, TransferCounters, TransferStats};
use crate::transport::{DataTransport, TransportConfig, TransportHandler};

type PieceKey = (String, u32);

struct Pending {
    id: u64,
    tx: oneshot::Sender<Result<Piece>>,
}

/// UDP/TCP piece transport
pub struct DataService {
    config: TransportConfig,
    handler: RwLock<Option<Weak<dyn TransportHandler>>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    pending: Mutex<HashMap<PieceKey, Pending>>,
    next_request_id: AtomicU64,
    tcp_preferred: RwLock<HashSet<String>>,
    counters: TransferCounters,
    losses: LossTracker,
    shutdown: watch::Sender<bool>,
}

impl DataService {
    /// Create a new, not yet bound service
    pub fn new(config: TransportConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            handler: RwLock::new(None),
            socket: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            tcp_preferred: RwLock::new(HashSet::new()),
            counters: TransferCounters::new(),
            losses: LossTracker::new(),
            shutdown,
        }
    }

    /// Register the callbacks for the listening side; held weakly
    pub fn set_handler<H: TransportHandler + 'static>(&self, handler: &Arc<H>) {
        let strong: Arc<dyn TransportHandler> = handler.clone();
        let weak: Weak<dyn TransportHandler> = Arc::downgrade(&strong);
        *sync::write(&self.handler) = Some(weak);
    }

    /// Bind the UDP socket and the TCP fallback listener and start serving.
    /// Peers reach the fallback at their control port + 1, so the caller
    /// passes that port. Returns the bound (UDP, TCP) addresses.
    pub async fn start(self: &Arc<Self>, fallback_port: u16) -> Result<(SocketAddr, SocketAddr)> {
        let udp_target = format!("{}:{}", self.config.bind_host, self.config.data_port);
        let socket = UdpSocket::bind(&udp_target).await.map_err(|e| {
            error!("Failed to bind UDP data socket on {}: {}", udp_target, e);
            NodeError::network_error_full("Failed to bind UDP socket", udp_target.clone(), e.to_string())
        })?;
        let tcp_target = format!("{}:{}", self.config.bind_host, fallback_port);
        let listener = TcpListener::bind(&tcp_target).await.map_err(|e| {
            error!("Failed to bind TCP fallback on {}: {}", tcp_target, e);
            NodeError::network_error_full("Failed to bind TCP fallback", tcp_target.clone(), e.to_string())
        })?;

        let socket = Arc::new(socket);
        let udp_addr = socket.local_addr()?;
        let tcp_addr = listener.local_addr()?;
        *sync::write(&self.socket) = Some(Arc::clone(&socket));

        let this = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { this.udp_loop(socket, shutdown).await });

        let this = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { this.tcp_loop(listener, shutdown).await });

        info!("Data transport on udp {} / tcp fallback {}", udp_addr, tcp_addr);
        Ok((udp_addr, tcp_addr))
    }

    /// Stop both listening loops
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        sync::write(&self.socket).take();
        sync::lock(&self.pending).clear();
    }

    /// UDP failure ratio observed for a file
    pub fn loss_rate(&self, file_hash: &str) -> f64 {
        self.losses.loss_rate(file_hash)
    }

    /// Whether UDP is skipped for a file
    pub fn is_tcp_preferred(&self, file_hash: &str) -> bool {
        sync::read(&self.tcp_preferred).contains(file_hash)
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        sync::read(&self.handler).as_ref().and_then(Weak::upgrade)
    }

    fn udp_socket(&self) -> Result<Arc<UdpSocket>> {
        sync::read(&self.socket)
            .clone()
            .ok_or_else(|| NodeError::transport_error("Data transport is not started").into())
    }

    async fn provide(&self, file_hash: &str, index: u32) -> Option<Piece> {
        match self.handler() {
            Some(handler) => handler.provide_piece(file_hash, index).await,
            None => None,
        }
    }

    fn report_loss(&self, file_hash: &str, index: u32) {
        let rate = self.losses.record_failure(file_hash);
        if let Some(handler) = self.handler() {
            let action = handler.on_loss_alert(file_hash, index, rate);
            debug!("Loss rate {:.2} for {} piece {} -> {}", rate, file_hash, index, action);
        }
    }

    async fn request_over_udp(&self, peer: &PeerInfo, file_hash: &str, index: u32) -> Result<Piece> {
        let socket = self.udp_socket()?;
        let addr = peer.resolve_data_addr().await?;
        let key = (file_hash.to_string(), index);
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        sync::lock(&self.pending).insert(key.clone(), Pending { id, tx });

        let request = Frame::Request { file_hash: file_hash.to_string(), index }.encode();
        let result: Result<Piece> = async {
            socket.send_to(&request, addr).await.map_err(|e| {
                NodeError::transport_error_full("UDP send failed", addr.to_string(), e.to_string())
            })?;
            trace!("Requested piece {} of {} from {} over UDP", index, file_hash, addr);
            match timeout(self.config.udp_timeout, rx).await {
                Err(_) => Err(NodeError::transport_error_full("UDP request timed out", addr.to_string(), format!("piece {}", index)).into()),
                Ok(Err(_)) => Err(NodeError::transport_error("UDP request superseded").into()),
                Ok(Ok(result)) => result,
            }
        }
        .await;

        let mut pending = sync::lock(&self.pending);
        if pending.get(&key).map(|p| p.id) == Some(id) {
            pending.remove(&key);
        }
        result
    }

    async fn request_over_tcp(&self, peer: &PeerInfo, file_hash: &str, index: u32) -> Result<Piece> {
        let addr = peer.fallback_addr();
        let mut stream = self.connect_fallback(&addr).await?;

        let exchange = async {
            write_frame(&mut stream, &Frame::Request { file_hash: file_hash.to_string(), index }).await?;
            read_frame(&mut stream).await
        };
        let frame = timeout(self.config.tcp_request_timeout, exchange)
            .await
            .map_err(|_| NodeError::transport_error_full("TCP request timed out", addr.clone(), format!("piece {}", index)))??;

        if frame.key() != (file_hash, index) {
            let (answered_hash, answered_index) = frame.key();
            return Err(NodeError::protocol_error_with_source(
                format!("Peer answered {} for the wrong piece", frame.tag()),
                format!("{} piece {}", answered_hash, answered_index),
            )
            .into());
        }
        match frame {
            Frame::Piece(piece) => {
                piece.ensure_valid()?;
                Ok(piece)
            }
            Frame::Error { message, .. } => {
                Err(NodeError::transport_error_full("Peer cannot serve piece", addr, message).into())
            }
            Frame::Request { .. } => Err(NodeError::protocol_error("Unexpected REQUEST in reply").into()),
        }
    }

    async fn send_over_tcp(&self, peer: &PeerInfo, piece: &Piece) -> Result<()> {
        let addr = peer.fallback_addr();
        let mut stream = self.connect_fallback(&addr).await?;
        let push = async {
            write_frame(&mut stream, &Frame::Piece(piece.clone())).await?;
            stream.shutdown().await?;
            Ok::<(), anyhow::Error>(())
        };
        timeout(self.config.tcp_request_timeout, push)
            .await
            .map_err(|_| NodeError::transport_error_full("TCP push timed out", addr, format!("piece {}", piece.index)))?
    }

    async fn connect_fallback(&self, addr: &str) -> Result<TcpStream> {
        let stream = timeout(self.config.tcp_connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::transport_error_full("TCP fallback connect timed out", addr, "timeout"))?
            .map_err(|e| {
                warn!("Failed to connect to TCP fallback {}: {}", addr, e);
                NodeError::transport_error_full("TCP fallback connect failed", addr, e.to_string())
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let received = tokio::select! {
                res = socket.recv_from(&mut buf) => res,
                _ = shutdown.changed() => break,
            };
            let (len, from) = match received {
                Ok(v) => v,
                Err(e) => {
                    debug!("UDP receive error: {}", e);
                    continue;
                }
            };
            let frame = match Frame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            match frame {
                Frame::Request { file_hash, index } => {
                    let this = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move { this.serve_udp_request(&socket, from, file_hash, index).await });
                }
                Frame::Piece(piece) => self.accept_udp_piece(piece, from),
                Frame::Error { file_hash, index, message } => self.fail_pending(&file_hash, index, from, message),
            }
        }
        debug!("UDP data loop stopped");
    }

    async fn serve_udp_request(&self, socket: &UdpSocket, to: SocketAddr, file_hash: String, index: u32) {
        let _active = self.counters.begin_send();
        let (reply, payload) = match self.provide(&file_hash, index).await {
            Some(piece) => {
                let len = piece.len();
                let bytes = Frame::Piece(piece).encode();
                if bytes.len() > MAX_UDP_PAYLOAD {
                    debug!("Piece {} of {} is too large for UDP ({} bytes)", index, file_hash, bytes.len());
                    let message = format!("piece too large for UDP ({} bytes)", bytes.len());
                    (Frame::Error { file_hash, index, message }.encode(), 0)
                } else {
                    (bytes, len)
                }
            }
            None => {
                let message = "piece not available".to_string();
                (Frame::Error { file_hash, index, message }.encode(), 0)
            }
        };

        match socket.send_to(&reply, to).await {
            Ok(_) if payload > 0 => self.counters.add_bytes_sent(payload),
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to answer UDP request from {}: {}", to, e);
                self.counters.send_failed();
            }
        }
    }

    fn accept_udp_piece(&self, piece: Piece, from: SocketAddr) {
        let key = (piece.file_hash.clone(), piece.index);
        let pending = sync::lock(&self.pending).remove(&key);
        match pending {
            Some(pending) => {
                let result = piece.ensure_valid().map(|_| piece);
                if let Err(e) = &result {
                    warn!("Corrupt UDP piece from {}: {}", from, e);
                }
                let _ = pending.tx.send(result);
            }
            None => self.deliver_unsolicited(piece, from),
        }
    }

    fn fail_pending(&self, file_hash: &str, index: u32, from: SocketAddr, message: String) {
        let key = (file_hash.to_string(), index);
        if let Some(pending) = sync::lock(&self.pending).remove(&key) {
            debug!("Peer {} cannot serve piece {} of {} over UDP: {}", from, index, file_hash, message);
            let _ = pending
                .tx
                .send(Err(NodeError::transport_error_full("Peer cannot serve piece", from.to_string(), message).into()));
        }
    }

    fn deliver_unsolicited(&self, piece: Piece, from: impl std::fmt::Display) {
        let _active = self.counters.begin_receive();
        if !piece.verify() {
            warn!("Dropping corrupt piece {} of {} pushed by {}", piece.index, piece.file_hash, from);
            self.counters.receive_failed();
            return;
        }
        self.counters.add_bytes_received(piece.len());
        match self.handler() {
            Some(handler) => {
                tokio::spawn(async move { handler.on_piece_received(piece).await });
            }
            None => debug!("No handler for piece pushed by {}", from),
        }
    }

    async fn tcp_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.changed() => break,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.serve_tcp_connection(stream, remote).await });
                }
                Err(e) => warn!("Failed to accept TCP fallback connection: {}", e),
            }
        }
        debug!("TCP fallback loop stopped");
    }

    async fn serve_tcp_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let frame = match timeout(self.config.tcp_request_timeout, read_frame(&mut reader)).await {
                Err(_) => {
                    debug!("TCP fallback connection from {} idle, closing", remote);
                    break;
                }
                Ok(Err(e)) => {
                    if !is_eof(&e) {
                        warn!("Bad frame from {}: {}", remote, e);
                    }
                    break;
                }
                Ok(Ok(frame)) => frame,
            };

            match frame {
                Frame::Request { file_hash, index } => {
                    let _active = self.counters.begin_send();
                    let (reply, payload) = match self.provide(&file_hash, index).await {
                        Some(piece) => {
                            let len = piece.len();
                            (Frame::Piece(piece), len)
                        }
                        None => {
                            let message = "piece not available".to_string();
                            (Frame::Error { file_hash, index, message }, 0)
                        }
                    };
                    if let Err(e) = write_frame(&mut write_half, &reply).await {
                        warn!("Failed to answer TCP request from {}: {}", remote, e);
                        self.counters.send_failed();
                        break;
                    }
                    self.counters.add_bytes_sent(payload);
                }
                Frame::Piece(piece) => self.deliver_unsolicited(piece, remote),
                Frame::Error { file_hash, index, message } => {
                    debug!("Unsolicited error from {} for piece {} of {}: {}", remote, index, file_hash, message);
                }
            }
        }
        let _ = write_half.shutdown().await;
    }
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| e.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

#[async_trait]
impl DataTransport for DataService {
    async fn send_piece(&self, peer: &PeerInfo, piece: &Piece) -> Result<()> {
        let _active = self.counters.begin_send();

        if !self.is_tcp_preferred(&piece.file_hash) {
            let frame = Frame::Piece(piece.clone()).encode();
            if frame.len() > MAX_UDP_PAYLOAD {
                debug!("Piece {} ({} bytes framed) exceeds the UDP ceiling", piece.index, frame.len());
            } else {
                let sent = async {
                    let socket = self.udp_socket()?;
                    let addr = peer.resolve_data_addr().await?;
                    socket.send_to(&frame, addr).await?;
                    Ok::<(), anyhow::Error>(())
                }
                .await;
                match sent {
                    Ok(()) => {
                        self.counters.add_bytes_sent(piece.len());
                        trace!("Pushed piece {} of {} to {} over UDP", piece.index, piece.file_hash, peer.id);
                        return Ok(());
                    }
                    Err(e) => warn!("UDP push of piece {} to {} failed: {}", piece.index, peer.id, e),
                }
            }
            self.counters.fallback();
        }

        match self.send_over_tcp(peer, piece).await {
            Ok(()) => {
                self.counters.add_bytes_sent(piece.len());
                Ok(())
            }
            Err(e) => {
                error!("Failed to push piece {} of {} to {}: {}", piece.index, piece.file_hash, peer.id, e);
                self.counters.send_failed();
                Err(e)
            }
        }
    }

    async fn request_piece(&self, peer: &PeerInfo, file_hash: &str, index: u32) -> Result<Piece> {
        let _active = self.counters.begin_receive();

        if !self.is_tcp_preferred(file_hash) {
            self.losses.record_attempt(file_hash);
            match self.request_over_udp(peer, file_hash, index).await {
                Ok(piece) => {
                    self.counters.add_bytes_received(piece.len());
                    return Ok(piece);
                }
                Err(e) => {
                    debug!("UDP fetch of piece {} of {} from {} failed: {}", index, file_hash, peer.id, e);
                    self.report_loss(file_hash, index);
                    self.counters.fallback();
                }
            }
        }

        match self.request_over_tcp(peer, file_hash, index).await {
            Ok(piece) => {
                self.counters.add_bytes_received(piece.len());
                trace!("Fetched piece {} of {} from {} over TCP", index, file_hash, peer.id);
                Ok(piece)
            }
            Err(e) => {
                warn!("Failed to fetch piece {} of {} from {}: {}", index, file_hash, peer.id, e);
                self.counters.receive_failed();
                Err(e)
            }
        }
    }

    fn prefer_tcp(&self, file_hash: &str) {
        if sync::write(&self.tcp_preferred).insert(file_hash.to_string()) {
            info!("Using TCP for file {}", file_hash);
        }
    }

    fn stats(&self) -> TransferStats {
        self.counters.snapshot()
    }
}
