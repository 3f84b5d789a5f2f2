//! Controller
//!
//! Ties the stores, the scheduler, the control client and the data
//! transport together. It answers inbound control messages, serves pieces
//! to peers and drives downloads: batch selection, fetch, verification,
//! checkpointing, retry and whole-file verification.

pub mod events;
pub mod session;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::control::{ControlClient, MessageHandler};
use crate::error::NodeError;
use crate::peer::{PeerDirectory, PeerInfo};
use crate::protocol::ControlMessage;
use crate::scheduler::{PieceScheduler, SelectionMode};
use crate::storage::{FileManifest, FileStore, ManifestStore, Piece, PieceBitmap, ResumeStore};
use crate::sync;
use crate::transport::{DataTransport, LossAction, TransferStats, TransportHandler};

pub use events::{ChannelListener, ControlEvent, ControlEventListener, ControlEvents};
pub use session::{DownloadHandle, DownloadOutcome, TransferSession};

/// Loss rate above which a file switches to TCP
pub const LOSS_FALLBACK_THRESHOLD: f64 = 0.30;

/// Loss rate above which a piece is re-requested
pub const LOSS_RETRANSMIT_THRESHOLD: f64 = 0.10;

/// Download behaviour
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pieces requested concurrently per download
    pub max_in_flight: usize,
    /// Failed attempts tolerated per piece before the download fails
    pub max_piece_retries: u32,
    /// Attempts for each checkpoint write
    pub checkpoint_attempts: u32,
    /// Selection mode for new downloads
    pub selection_mode: SelectionMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            max_piece_retries: 3,
            checkpoint_attempts: 3,
            selection_mode: SelectionMode::RarestFirst,
        }
    }
}

/// Collaborators handed to the controller at construction
pub struct Components {
    pub manifests: Arc<ManifestStore>,
    pub scheduler: Arc<PieceScheduler>,
    pub resume: Arc<ResumeStore>,
    pub files: Arc<FileStore>,
    pub directory: Arc<PeerDirectory>,
    pub client: Arc<ControlClient>,
    pub transport: Arc<dyn DataTransport>,
}

/// Aggregate counts for `stat`
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub peer_id: String,
    pub manifests: usize,
    pub complete_files: usize,
    pub peers: usize,
    pub active_sessions: usize,
    pub transfer: TransferStats,
}

/// Node orchestration
pub struct Controller {
    me: Weak<Controller>,
    config: ControllerConfig,
    manifests: Arc<ManifestStore>,
    scheduler: Arc<PieceScheduler>,
    resume: Arc<ResumeStore>,
    files: Arc<FileStore>,
    directory: Arc<PeerDirectory>,
    client: Arc<ControlClient>,
    transport: Arc<dyn DataTransport>,
    events: ControlEvents,
    sessions: RwLock<HashMap<String, Arc<TransferSession>>>,
}

impl Controller {
    /// Build a controller
    pub fn new(config: ControllerConfig, components: Components) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            manifests: components.manifests,
            scheduler: components.scheduler,
            resume: components.resume,
            files: components.files,
            directory: components.directory,
            client: components.client,
            transport: components.transport,
            events: ControlEvents::new(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn events(&self) -> &ControlEvents {
        &self.events
    }

    pub fn manifests(&self) -> &Arc<ManifestStore> {
        &self.manifests
    }

    pub fn scheduler(&self) -> &Arc<PieceScheduler> {
        &self.scheduler
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Hash a local file, publish its manifest and mark every piece available
    pub async fn share_file(&self, path: &Path, piece_size: u32) -> Result<Arc<FileManifest>> {
        let manifest = FileManifest::from_path(path, piece_size).await?;
        let file_hash = manifest.file_hash.clone();

        if !self.manifests.add_manifest(manifest.clone()) {
            let existing = self.manifests.get_manifest(&file_hash);
            if existing.as_deref() != Some(&manifest) {
                return Err(NodeError::validation_error_with_field(
                    format!("File {} is already known with a different piece layout", file_hash),
                    "piece_size",
                )
                .into());
            }
        }
        for index in 0..manifest.piece_count {
            self.manifests.mark_piece_available(&file_hash, index)?;
        }
        self.files.register(&file_hash, path.to_path_buf());
        info!("Sharing {} as {} ({} pieces)", path.display(), file_hash, manifest.piece_count);

        self.manifests
            .get_manifest(&file_hash)
            .ok_or_else(|| NodeError::storage_error(format!("Manifest {} vanished", file_hash)).into())
    }

    /// Offer a file to every known peer, then announce the pieces held.
    /// Returns the number of peers that accepted the offer.
    pub async fn offer_to_peers(&self, file_hash: &str) -> Result<usize> {
        let manifest = self.manifests.get_manifest(file_hash).ok_or_else(|| {
            NodeError::validation_error_with_field(format!("Unknown file {}", file_hash), "file_hash")
        })?;
        let peers = self.directory.list_peers();
        if peers.is_empty() {
            debug!("No peers to offer {} to", file_hash);
            return Ok(0);
        }

        let mut offers = Vec::with_capacity(peers.len());
        for peer in peers {
            let client = Arc::clone(&self.client);
            let manifest = Arc::clone(&manifest);
            offers.push(tokio::spawn(async move {
                let result = client.send_offer_file(&peer, &manifest).await;
                (peer, result)
            }));
        }

        let held: Vec<u32> = self
            .manifests
            .availability(file_hash)
            .map(|bitmap| bitmap.iter_set().collect())
            .unwrap_or_default();

        let mut accepted = 0;
        for offer in offers {
            match offer.await {
                Ok((peer, Ok(()))) => {
                    accepted += 1;
                    if !held.is_empty() {
                        self.client.send_have(&peer, file_hash, held.clone());
                    }
                }
                Ok((peer, Err(e))) => warn!("Peer {} did not accept offer of {}: {}", peer.id, file_hash, e),
                Err(e) => error!("Offer task failed: {}", e),
            }
        }
        info!("Offered {} to {} peers", file_hash, accepted);
        Ok(accepted)
    }

    /// Start (or resume) downloading a file into `output`
    pub async fn start_download(&self, file_hash: &str, output: &Path) -> Result<DownloadHandle> {
        let manifest = self.manifests.get_manifest(file_hash).ok_or_else(|| {
            NodeError::validation_error_with_field(format!("Unknown file {}", file_hash), "file_hash")
        })?;
        if let Some(session) = self.session(file_hash) {
            debug!("Download of {} already active", file_hash);
            return Ok(session.handle());
        }
        if self.manifests.is_complete(file_hash) {
            return Err(NodeError::validation_error(format!("File {} is already held locally", file_hash)).into());
        }
        if self.candidate_peers(file_hash).is_empty() {
            return Err(NodeError::peer_error(format!("No peers known for file {}", file_hash)).into());
        }

        self.files.prepare_output(&manifest, output).await?;
        let restored = self.apply_checkpoint(&manifest, output).await;

        let session = {
            let mut sessions = sync::write(&self.sessions);
            if let Some(existing) = sessions.get(file_hash) {
                return Ok(existing.handle());
            }
            let session = Arc::new(TransferSession::new(file_hash, output.to_path_buf()));
            sessions.insert(file_hash.to_string(), Arc::clone(&session));
            session
        };
        self.scheduler.set_mode(file_hash, self.config.selection_mode);
        let handle = session.handle();

        let (available, total) = self.manifests.progress(file_hash).unwrap_or((0, manifest.piece_count));
        info!(
            "Downloading {} ({}) to {}: {}/{} pieces present ({} from checkpoint)",
            manifest.file_name,
            file_hash,
            output.display(),
            available,
            total,
            restored
        );

        if self.manifests.is_complete(file_hash) {
            self.spawn_verification(session);
        } else {
            self.schedule_next_pieces(file_hash);
        }
        Ok(handle)
    }

    /// Stop a download; in-flight fetches finish but their results are dropped
    pub fn cancel_transfer(&self, file_hash: &str) -> bool {
        let Some(session) = self.take_session(file_hash) else {
            debug!("No active download of {} to cancel", file_hash);
            return false;
        };
        session.cancel();
        self.scheduler.clear_schedule(file_hash);
        session.finish(DownloadOutcome::Cancelled);
        info!("Cancelled download of {}", file_hash);
        true
    }

    /// File hashes with an active download
    pub fn active_downloads(&self) -> Vec<String> {
        let mut hashes: Vec<String> = sync::read(&self.sessions).keys().cloned().collect();
        hashes.sort();
        hashes
    }

    /// Push a locally held piece to a peer
    pub async fn send_piece(&self, peer_id: &str, file_hash: &str, index: u32) -> Result<()> {
        let peer = self
            .directory
            .get_peer(peer_id)
            .ok_or_else(|| NodeError::peer_error_with_peer("Unknown peer", peer_id))?;
        let piece = self.load_piece(file_hash, index).await.ok_or_else(|| {
            NodeError::storage_error(format!("Piece {} of {} is not held locally", index, file_hash))
        })?;
        self.transport.send_piece(&peer, &piece).await
    }

    /// A piece was stored and verified
    pub async fn on_piece_done(&self, file_hash: &str, index: u32) {
        let newly = match self.manifests.mark_piece_available(file_hash, index) {
            Ok(newly) => newly,
            Err(e) => {
                warn!("Cannot record piece {} of {}: {}", index, file_hash, e);
                return;
            }
        };
        self.scheduler.mark_piece_completed(file_hash, index);
        if !newly {
            trace!("Piece {} of {} already recorded", index, file_hash);
            return;
        }

        let session = self.session(file_hash);
        if let Some(session) = &session {
            self.save_checkpoint(session).await;
        }

        let (available, total) = self.manifests.progress(file_hash).unwrap_or((0, 0));
        debug!("Piece {} of {} done ({}/{})", index, file_hash, available, total);
        self.events.piece_received(file_hash, index, available, total);

        match session {
            Some(session) if self.manifests.is_complete(file_hash) => self.verify_complete_file(&session).await,
            Some(_) => self.schedule_next_pieces(file_hash),
            None => {}
        }
    }

    /// A fetched piece failed verification
    pub fn on_piece_crc_error(&self, file_hash: &str, index: u32) {
        warn!("Piece {} of {} failed hash verification", index, file_hash);
        self.scheduler.mark_piece_failed(file_hash, index);
        if let Some(session) = self.session(file_hash) {
            self.retry_piece(&session, index, "hash mismatch");
        }
    }

    /// Aggregate counters
    pub fn stats(&self) -> NodeStats {
        let hashes = self.manifests.file_hashes();
        NodeStats {
            peer_id: self.client.local_peer_id().to_string(),
            manifests: hashes.len(),
            complete_files: hashes.iter().filter(|h| self.manifests.is_complete(h)).count(),
            peers: self.directory.count(),
            active_sessions: sync::read(&self.sessions).len(),
            transfer: self.transport.stats(),
        }
    }

    fn session(&self, file_hash: &str) -> Option<Arc<TransferSession>> {
        sync::read(&self.sessions).get(file_hash).cloned()
    }

    fn take_session(&self, file_hash: &str) -> Option<Arc<TransferSession>> {
        sync::write(&self.sessions).remove(file_hash)
    }

    /// Directory peers known to hold the file, or every directory peer if none are
    fn candidate_peers(&self, file_hash: &str) -> Vec<PeerInfo> {
        let holders: Vec<PeerInfo> = self
            .manifests
            .peers_for_file(file_hash)
            .iter()
            .filter_map(|id| self.directory.get_peer(id))
            .collect();
        if holders.is_empty() {
            self.directory.list_peers()
        } else {
            holders
        }
    }

    async fn apply_checkpoint(&self, manifest: &FileManifest, output: &Path) -> u32 {
        let file_hash = &manifest.file_hash;
        let Some(checkpoint) = self.resume.load(file_hash).await else {
            return 0;
        };
        if checkpoint.downloaded_pieces.len() != manifest.piece_count {
            warn!("Checkpoint for {} has the wrong piece count, ignoring", file_hash);
            return 0;
        }
        if let Some(previous) = &checkpoint.output_path {
            if previous != output {
                warn!(
                    "Checkpoint for {} points at {}, not {}; starting over",
                    file_hash,
                    previous.display(),
                    output.display()
                );
                return 0;
            }
        }

        let mut restored = 0;
        for index in checkpoint.downloaded_pieces.iter_set() {
            match self.files.read_piece(manifest, index).await {
                Ok(data) if self.manifests.verify_piece(file_hash, index, &data) => {
                    if let Ok(true) = self.manifests.mark_piece_available(file_hash, index) {
                        restored += 1;
                    }
                }
                Ok(_) => debug!("Checkpointed piece {} of {} is corrupt on disk", index, file_hash),
                Err(e) => debug!("Checkpointed piece {} of {} unreadable: {}", index, file_hash, e),
            }
        }
        info!(
            "Resumed {} with {}/{} checkpointed pieces intact",
            file_hash,
            restored,
            checkpoint.downloaded_pieces.count()
        );
        restored
    }

    /// Keep up to `max_in_flight` pieces of a download in flight
    fn schedule_next_pieces(&self, file_hash: &str) {
        let Some(session) = self.session(file_hash) else {
            return;
        };
        if session.is_cancelled() {
            return;
        }

        let pieces = {
            let _guard = sync::lock(&session.schedule_lock);
            let in_flight = self.scheduler.in_flight_count(file_hash);
            let wanted = self.config.max_in_flight.saturating_sub(in_flight);
            if wanted == 0 {
                return;
            }
            self.scheduler.get_next_pieces(file_hash, wanted)
        };
        if pieces.is_empty() {
            return;
        }

        let peers = self.candidate_peers(file_hash);
        if peers.is_empty() {
            for &index in &pieces {
                self.scheduler.mark_piece_failed(file_hash, index);
            }
            self.fail_download(file_hash, "no peers available");
            return;
        }

        let mut assigned: HashMap<usize, Vec<u32>> = HashMap::new();
        for &index in &pieces {
            assigned.entry(session.next_peer(peers.len())).or_default().push(index);
        }
        for (slot, indices) in assigned {
            let peer = &peers[slot];
            trace!("Fetching pieces {:?} of {} from {}", indices, file_hash, peer.id);
            // Advisory; the bytes themselves are pulled over the data transport
            self.client.send_async(
                peer,
                ControlMessage::request_pieces(self.client.local_peer_id(), file_hash, indices.clone()),
            );
            for index in indices {
                self.spawn_fetch(Arc::clone(&session), peer.clone(), index);
            }
        }
    }

    fn spawn_fetch(&self, session: Arc<TransferSession>, peer: PeerInfo, index: u32) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.fetch_piece(session, peer, index).await;
        });
    }

    fn spawn_verification(&self, session: Arc<TransferSession>) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.verify_complete_file(&session).await;
        });
    }

    async fn fetch_piece(&self, session: Arc<TransferSession>, peer: PeerInfo, index: u32) {
        let file_hash = session.file_hash().to_string();
        if session.is_cancelled() {
            return;
        }

        let fetched = self.fetch_verified(&peer, &file_hash, index).await;
        if session.is_cancelled() {
            debug!("Discarding piece {} of cancelled download {}", index, file_hash);
            return;
        }

        let stored = match fetched {
            Ok(piece) => self.store_piece(&piece).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => self.on_piece_done(&file_hash, index).await,
            Err(e) if NodeError::is_integrity_failure(&e) => self.on_piece_crc_error(&file_hash, index),
            Err(e) => {
                warn!("Fetching piece {} of {} from {} failed: {}", index, file_hash, peer.id, e);
                self.scheduler.mark_piece_failed(&file_hash, index);
                self.retry_piece(&session, index, &e.to_string());
            }
        }
    }

    /// Fetch a piece and check it against the manifest
    async fn fetch_verified(&self, peer: &PeerInfo, file_hash: &str, index: u32) -> Result<Piece> {
        let piece = self.transport.request_piece(peer, file_hash, index).await?;
        if !self.manifests.verify_piece(file_hash, index, &piece.data) {
            return Err(NodeError::piece_integrity_error("Piece does not match the manifest", file_hash, index).into());
        }
        Ok(piece)
    }

    async fn store_piece(&self, piece: &Piece) -> Result<()> {
        let manifest = self.manifests.get_manifest(&piece.file_hash).ok_or_else(|| {
            NodeError::validation_error_with_field(format!("Unknown file {}", piece.file_hash), "file_hash")
        })?;
        self.files.write_piece(&manifest, piece.index, &piece.data).await
    }

    /// Re-request a failed piece from the next peer within its retry budget
    fn retry_piece(&self, session: &Arc<TransferSession>, index: u32, reason: &str) {
        let file_hash = session.file_hash();
        if session.is_cancelled() {
            return;
        }
        let failures = session.record_failure(index);
        if failures > self.config.max_piece_retries {
            self.fail_download(
                file_hash,
                &format!("piece {} failed {} times, last error: {}", index, failures, reason),
            );
            return;
        }

        if !self.scheduler.reserve(file_hash, index) {
            // Already available or picked up by another fetch
            self.schedule_next_pieces(file_hash);
            return;
        }
        let peers = self.candidate_peers(file_hash);
        if peers.is_empty() {
            self.scheduler.mark_piece_failed(file_hash, index);
            self.fail_download(file_hash, "no peers available");
            return;
        }
        let peer = peers[session.next_peer(peers.len())].clone();
        debug!("Retrying piece {} of {} from {} (failure {})", index, file_hash, peer.id, failures);
        self.spawn_fetch(Arc::clone(session), peer, index);
    }

    async fn save_checkpoint(&self, session: &TransferSession) {
        let file_hash = session.file_hash();
        let _guard = session.checkpoint_lock.lock().await;
        if session.is_finished() || session.is_cancelled() {
            return;
        }
        let Some(bitmap) = self.manifests.availability(file_hash) else {
            return;
        };

        let attempts = self.config.checkpoint_attempts.max(1);
        for attempt in 1..=attempts {
            match self.resume.save(file_hash, &bitmap, Some(session.output())).await {
                Ok(()) => return,
                Err(e) => warn!("Checkpoint write for {} failed (attempt {}/{}): {}", file_hash, attempt, attempts, e),
            }
        }
        error!("Giving up on checkpoint for {} after {} attempts", file_hash, attempts);
    }

    /// Verify the assembled file; on a mismatch re-fetch the corrupt pieces once
    async fn verify_complete_file(&self, session: &Arc<TransferSession>) {
        if !session.begin_verification() {
            return;
        }
        let file_hash = session.file_hash().to_string();
        let Some(manifest) = self.manifests.get_manifest(&file_hash) else {
            self.fail_download(&file_hash, "manifest missing");
            return;
        };

        for round in 0..2 {
            let pieces = match self.files.read_all_pieces(&manifest).await {
                Ok(pieces) => pieces,
                Err(e) => {
                    self.fail_download(&file_hash, &format!("cannot read back file: {}", e));
                    return;
                }
            };
            if self.manifests.verify_file(&file_hash, &pieces) {
                self.complete_download(session).await;
                return;
            }

            let corrupt = self.manifests.find_corrupt_pieces(&file_hash, &pieces);
            warn!(
                "Whole-file hash mismatch for {} ({} corrupt pieces: {:?})",
                file_hash,
                corrupt.len(),
                corrupt
            );
            if round > 0 || corrupt.is_empty() || !self.repair_pieces(session, &manifest, &corrupt).await {
                break;
            }
        }
        self.fail_download(&file_hash, "whole-file hash mismatch");
    }

    /// Re-fetch pieces directly, bypassing the scheduler
    async fn repair_pieces(&self, session: &TransferSession, manifest: &FileManifest, corrupt: &[u32]) -> bool {
        let file_hash = &manifest.file_hash;
        for &index in corrupt {
            let mut repaired = false;
            for attempt in 0..=self.config.max_piece_retries {
                if session.is_cancelled() {
                    return false;
                }
                let peers = self.candidate_peers(file_hash);
                if peers.is_empty() {
                    return false;
                }
                let peer = &peers[session.next_peer(peers.len())];
                let result = match self.fetch_verified(peer, file_hash, index).await {
                    Ok(piece) => self.store_piece(&piece).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        info!("Repaired piece {} of {} from {}", index, file_hash, peer.id);
                        repaired = true;
                        break;
                    }
                    Err(e) => debug!("Repair of piece {} of {} failed (attempt {}): {}", index, file_hash, attempt + 1, e),
                }
            }
            if !repaired {
                return false;
            }
        }
        true
    }

    async fn complete_download(&self, session: &TransferSession) {
        let file_hash = session.file_hash();
        {
            let _guard = session.checkpoint_lock.lock().await;
            if let Err(e) = self.resume.delete(file_hash).await {
                warn!("Failed to delete checkpoint for {}: {}", file_hash, e);
            }
            info!("Download of {} complete: {}", file_hash, session.output().display());
            self.events.download_completed(file_hash, Some(session.output()));
            session.finish(DownloadOutcome::Completed);
        }
        self.take_session(file_hash);
    }

    fn fail_download(&self, file_hash: &str, reason: &str) {
        let Some(session) = self.take_session(file_hash) else {
            return;
        };
        session.cancel();
        self.scheduler.clear_schedule(file_hash);
        error!("Download of {} failed: {}", file_hash, reason);
        self.events.download_failed(file_hash, reason);
        session.finish(DownloadOutcome::Failed(reason.to_string()));
    }

    async fn load_piece(&self, file_hash: &str, index: u32) -> Option<Piece> {
        if !self.manifests.is_piece_available(file_hash, index) {
            return None;
        }
        let manifest = self.manifests.get_manifest(file_hash)?;
        let hash = manifest.piece_hash(index)?.to_string();
        match self.files.read_piece(&manifest, index).await {
            Ok(data) => Some(Piece::new(file_hash, index, data, hash)),
            Err(e) => {
                warn!("Cannot serve piece {} of {}: {}", index, file_hash, e);
                None
            }
        }
    }

    fn handle_loss(&self, file_hash: &str, index: u32, loss_rate: f64) -> LossAction {
        if loss_rate > LOSS_FALLBACK_THRESHOLD {
            warn!("Loss rate {:.2} for {}, switching to TCP", loss_rate, file_hash);
            self.transport.prefer_tcp(file_hash);
            LossAction::FallbackTcp
        } else if loss_rate > LOSS_RETRANSMIT_THRESHOLD {
            debug!("Loss rate {:.2} for {}, re-requesting piece {}", loss_rate, file_hash, index);
            // A piece still in flight is retried by the transport itself
            if let Some(session) = self.session(file_hash) {
                if !session.is_cancelled() && self.scheduler.reserve(file_hash, index) {
                    let peers = self.candidate_peers(file_hash);
                    if let Some(peer) = peers.get(session.next_peer(peers.len())) {
                        self.spawn_fetch(Arc::clone(&session), peer.clone(), index);
                    } else {
                        self.scheduler.mark_piece_failed(file_hash, index);
                    }
                }
            }
            LossAction::Retransmit
        } else {
            LossAction::None
        }
    }
}

#[async_trait]
impl MessageHandler for Controller {
    fn local_peer_id(&self) -> &str {
        self.client.local_peer_id()
    }

    async fn on_offer_file(&self, sender: &str, manifest: &FileManifest) -> Result<()> {
        manifest.validate()?;
        if self.manifests.add_manifest(manifest.clone()) {
            info!("Peer {} offered new file {} ({})", sender, manifest.file_name, manifest.file_hash);
        }
        self.manifests.register_peer_for_file(&manifest.file_hash, sender);
        self.directory.touch(sender);
        self.events.file_offered(sender, manifest);
        Ok(())
    }

    async fn on_request_pieces(&self, sender: &str, file_hash: &str, pieces: &[u32]) -> Result<()> {
        if !self.manifests.has_manifest(file_hash) {
            return Err(NodeError::validation_error_with_field(format!("Unknown file {}", file_hash), "file_hash").into());
        }
        let held = pieces
            .iter()
            .filter(|&&index| self.manifests.is_piece_available(file_hash, index))
            .count();
        debug!("Peer {} wants {} pieces of {} ({} held here)", sender, pieces.len(), file_hash, held);
        self.directory.touch(sender);
        Ok(())
    }

    async fn on_have(&self, sender: &str, file_hash: &str, pieces: &[u32]) -> Result<()> {
        self.manifests.register_peer_for_file(file_hash, sender);
        self.directory.touch(sender);
        let Some(manifest) = self.manifests.get_manifest(file_hash) else {
            trace!("HAVE from {} for unknown file {}, rarity not tracked", sender, file_hash);
            return Ok(());
        };
        let len = manifest.piece_count;
        let bitmap = PieceBitmap::from_indices(len, pieces.iter().copied().filter(|&index| index < len));
        self.scheduler.update_peer_pieces(file_hash, sender, &bitmap);
        Ok(())
    }

    async fn on_ping(&self, sender: &str, _sequence: u64) {
        self.directory.touch(sender);
    }
}

#[async_trait]
impl TransportHandler for Controller {
    async fn provide_piece(&self, file_hash: &str, index: u32) -> Option<Piece> {
        self.load_piece(file_hash, index).await
    }

    async fn on_piece_received(&self, piece: Piece) {
        let file_hash = piece.file_hash.clone();
        let Some(session) = self.session(&file_hash) else {
            trace!("Ignoring pushed piece {} of {}: no download", piece.index, file_hash);
            return;
        };
        if session.is_cancelled() || self.manifests.is_piece_available(&file_hash, piece.index) {
            return;
        }
        if !self.manifests.verify_piece(&file_hash, piece.index, &piece.data) {
            warn!("Pushed piece {} of {} does not match the manifest", piece.index, file_hash);
            return;
        }
        match self.store_piece(&piece).await {
            Ok(()) => self.on_piece_done(&file_hash, piece.index).await,
            Err(e) => warn!("Failed to store pushed piece {} of {}: {}", piece.index, file_hash, e),
        }
    }

    fn on_loss_alert(&self, file_hash: &str, index: u32, loss_rate: f64) -> LossAction {
        self.handle_loss(file_hash, index, loss_rate)
    }
}
