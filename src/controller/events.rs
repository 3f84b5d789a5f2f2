//! Controller events
//!
//! Listeners are notified synchronously and isolated from each other: an
//! error or a panic in one listener is logged and the remaining listeners
//! still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::storage::manifest::FileManifest;
use crate::sync;

/// Callbacks for node activity; every method defaults to a no-op
pub trait ControlEventListener: Send + Sync {
    fn on_file_offered(&self, _peer_id: &str, _manifest: &FileManifest) -> Result<()> {
        Ok(())
    }

    fn on_piece_received(&self, _file_hash: &str, _index: u32, _available: u32, _total: u32) -> Result<()> {
        Ok(())
    }

    fn on_download_completed(&self, _file_hash: &str, _output: Option<&Path>) -> Result<()> {
        Ok(())
    }

    fn on_download_failed(&self, _file_hash: &str, _reason: &str) -> Result<()> {
        Ok(())
    }
}

/// Owned form of an event, for channel delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    FileOffered { peer_id: String, file_hash: String, file_name: String },
    PieceReceived { file_hash: String, index: u32, available: u32, total: u32 },
    DownloadCompleted { file_hash: String, output: Option<PathBuf> },
    DownloadFailed { file_hash: String, reason: String },
}

/// Forwards events into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its channel
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: ControlEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("event receiver dropped: {:?}", e.0))
    }
}

impl ControlEventListener for ChannelListener {
    fn on_file_offered(&self, peer_id: &str, manifest: &FileManifest) -> Result<()> {
        self.forward(ControlEvent::FileOffered {
            peer_id: peer_id.to_string(),
            file_hash: manifest.file_hash.clone(),
            file_name: manifest.file_name.clone(),
        })
    }

    fn on_piece_received(&self, file_hash: &str, index: u32, available: u32, total: u32) -> Result<()> {
        self.forward(ControlEvent::PieceReceived {
            file_hash: file_hash.to_string(),
            index,
            available,
            total,
        })
    }

    fn on_download_completed(&self, file_hash: &str, output: Option<&Path>) -> Result<()> {
        self.forward(ControlEvent::DownloadCompleted {
            file_hash: file_hash.to_string(),
            output: output.map(Path::to_path_buf),
        })
    }

    fn on_download_failed(&self, file_hash: &str, reason: &str) -> Result<()> {
        self.forward(ControlEvent::DownloadFailed {
            file_hash: file_hash.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Registered listeners
#[derive(Default)]
pub struct ControlEvents {
    listeners: RwLock<Vec<Arc<dyn ControlEventListener>>>,
}

impl ControlEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ControlEventListener>) {
        sync::write(&self.listeners).push(listener);
    }

    pub fn listener_count(&self) -> usize {
        sync::read(&self.listeners).len()
    }

    pub fn file_offered(&self, peer_id: &str, manifest: &FileManifest) {
        self.notify("file_offered", |l| l.on_file_offered(peer_id, manifest));
    }

    pub fn piece_received(&self, file_hash: &str, index: u32, available: u32, total: u32) {
        self.notify("piece_received", |l| l.on_piece_received(file_hash, index, available, total));
    }

    pub fn download_completed(&self, file_hash: &str, output: Option<&Path>) {
        self.notify("download_completed", |l| l.on_download_completed(file_hash, output));
    }

    pub fn download_failed(&self, file_hash: &str, reason: &str) {
        self.notify("download_failed", |l| l.on_download_failed(file_hash, reason));
    }

    fn notify(&self, event: &str, f: impl Fn(&dyn ControlEventListener) -> Result<()>) {
        // Snapshot so listeners may register further listeners
        let listeners = sync::read(&self.listeners).clone();
        trace!("Emitting {} to {} listeners", event, listeners.len());
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener failed on {}: {}", event, e),
                Err(_) => warn!("Listener panicked on {}", event),
            }
        }
    }
}
