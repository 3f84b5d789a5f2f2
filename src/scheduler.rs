//! Piece scheduler
//!
//! Chooses which missing pieces to request next, either in index order or
//! rarest-first, and tracks the pieces already in flight so that no piece
//! is requested twice at the same time.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::storage::bitmap::PieceBitmap;
use crate::storage::manifest::ManifestStore;
use crate::sync;

/// Piece selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Lowest index first
    Sequential,
    /// Fewest advertising peers first, ties by index
    #[default]
    RarestFirst,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::Sequential => write!(f, "sequential"),
            SelectionMode::RarestFirst => write!(f, "rarest-first"),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(SelectionMode::Sequential),
            "rarest-first" | "rarest_first" | "rarest" => Ok(SelectionMode::RarestFirst),
            other => Err(format!("unknown selection mode '{}'", other)),
        }
    }
}

/// Scheduling state for one file
#[derive(Debug, Default)]
struct ScheduleState {
    mode: SelectionMode,
    rarity: HashMap<u32, u32>,
    in_flight: BTreeSet<u32>,
}

/// Piece selection over a shared manifest store
#[derive(Debug)]
pub struct PieceScheduler {
    manifests: Arc<ManifestStore>,
    files: RwLock<HashMap<String, Arc<Mutex<ScheduleState>>>>,
}

impl PieceScheduler {
    /// Create a new scheduler reading availability from `manifests`
    pub fn new(manifests: Arc<ManifestStore>) -> Self {
        Self {
            manifests,
            files: RwLock::new(HashMap::new()),
        }
    }

    fn state(&self, file_hash: &str) -> Arc<Mutex<ScheduleState>> {
        if let Some(state) = sync::read(&self.files).get(file_hash) {
            return Arc::clone(state);
        }
        Arc::clone(sync::write(&self.files).entry(file_hash.to_string()).or_default())
    }

    /// Set the selection mode for a file
    pub fn set_mode(&self, file_hash: &str, mode: SelectionMode) {
        debug!("Selection mode for {} set to {}", file_hash, mode);
        sync::lock(&self.state(file_hash)).mode = mode;
    }

    /// Selection mode for a file (rarest-first unless set)
    pub fn mode(&self, file_hash: &str) -> SelectionMode {
        sync::read(&self.files)
            .get(file_hash)
            .map(|s| sync::lock(s).mode)
            .unwrap_or_default()
    }

    /// Select up to `count` missing, not-in-flight pieces and mark them in flight.
    /// Returns fewer (possibly zero) when candidates run out.
    pub fn get_next_pieces(&self, file_hash: &str, count: usize) -> Vec<u32> {
        if !self.manifests.has_manifest(file_hash) {
            return Vec::new();
        }
        let state = self.state(file_hash);
        let mut state = sync::lock(&state);

        let mut candidates: Vec<u32> = self
            .manifests
            .missing_pieces(file_hash)
            .into_iter()
            .filter(|index| !state.in_flight.contains(index))
            .collect();

        match state.mode {
            SelectionMode::Sequential => candidates.sort_unstable(),
            SelectionMode::RarestFirst => {
                let rarity = &state.rarity;
                candidates.sort_unstable_by_key(|index| (rarity.get(index).copied().unwrap_or(0), *index));
            }
        }
        candidates.truncate(count);

        state.in_flight.extend(candidates.iter().copied());
        trace!(
            "Selected {:?} for {} ({} mode, {} in flight)",
            candidates,
            file_hash,
            state.mode,
            state.in_flight.len()
        );
        candidates
    }

    /// Put one specific piece in flight if it is missing and not already in flight
    pub fn reserve(&self, file_hash: &str, index: u32) -> bool {
        if self.manifests.is_piece_available(file_hash, index) {
            return false;
        }
        let state = self.state(file_hash);
        let reserved = sync::lock(&state).in_flight.insert(index);
        reserved
    }

    /// Count one advertisement for every piece set in `bitmap`
    /// Advertisements for files without a manifest are ignored.
    pub fn update_peer_pieces(&self, file_hash: &str, peer_id: &str, bitmap: &PieceBitmap) {
        if !self.manifests.has_manifest(file_hash) {
            trace!("Ignoring advertisement from {} for unknown file {}", peer_id, file_hash);
            return;
        }
        let state = self.state(file_hash);
        let mut state = sync::lock(&state);
        for index in bitmap.iter_set() {
            *state.rarity.entry(index).or_insert(0) += 1;
        }
        debug!("Peer {} advertised {} pieces of {}", peer_id, bitmap.count(), file_hash);
    }

    /// Advertisement count for a piece
    pub fn rarity(&self, file_hash: &str, index: u32) -> u32 {
        sync::read(&self.files)
            .get(file_hash)
            .and_then(|s| sync::lock(s).rarity.get(&index).copied())
            .unwrap_or(0)
    }

    /// Remove a completed piece from the in-flight set
    pub fn mark_piece_completed(&self, file_hash: &str, index: u32) {
        self.remove_in_flight(file_hash, index);
    }

    /// Remove a failed piece from the in-flight set so it can be selected again
    pub fn mark_piece_failed(&self, file_hash: &str, index: u32) {
        debug!("Piece {} of {} failed, eligible for re-selection", index, file_hash);
        self.remove_in_flight(file_hash, index);
    }

    fn remove_in_flight(&self, file_hash: &str, index: u32) {
        if let Some(state) = sync::read(&self.files).get(file_hash) {
            sync::lock(state).in_flight.remove(&index);
        }
    }

    /// Whether a piece is currently in flight
    pub fn is_in_flight(&self, file_hash: &str, index: u32) -> bool {
        sync::read(&self.files)
            .get(file_hash)
            .map(|s| sync::lock(s).in_flight.contains(&index))
            .unwrap_or(false)
    }

    /// Number of pieces in flight for a file
    pub fn in_flight_count(&self, file_hash: &str) -> usize {
        sync::read(&self.files)
            .get(file_hash)
            .map(|s| sync::lock(s).in_flight.len())
            .unwrap_or(0)
    }

    /// Drop in-flight and rarity state for a file, keeping its mode
    pub fn clear_schedule(&self, file_hash: &str) {
        if let Some(state) = sync::read(&self.files).get(file_hash) {
            let mut state = sync::lock(state);
            state.in_flight.clear();
            state.rarity.clear();
        }
        debug!("Cleared schedule for {}", file_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::manifest::FileManifest;

    fn setup(piece_count: usize) -> (Arc<ManifestStore>, PieceScheduler, String) {
        let data = vec![7u8; piece_count * 4];
        let manifest = FileManifest::from_bytes("f", &data, 4).unwrap();
        let hash = manifest.file_hash.clone();
        let store = Arc::new(ManifestStore::new());
        store.add_manifest(manifest);
        let scheduler = PieceScheduler::new(Arc::clone(&store));
        (store, scheduler, hash)
    }

    #[test]
    fn test_default_mode_is_rarest_first() {
        let (_, scheduler, hash) = setup(3);
        assert_eq!(scheduler.mode(&hash), SelectionMode::RarestFirst);
    }

    #[test]
    fn test_rarest_first_example() {
        let (_, scheduler, hash) = setup(3);
        // rarity = {0:3, 1:1, 2:1}
        scheduler.update_peer_pieces(&hash, "p1", &PieceBitmap::from_indices(3, [0, 1]));
        scheduler.update_peer_pieces(&hash, "p2", &PieceBitmap::from_indices(3, [0, 2]));
        scheduler.update_peer_pieces(&hash, "p3", &PieceBitmap::from_indices(3, [0]));
        assert_eq!(scheduler.rarity(&hash, 0), 3);

        assert_eq!(scheduler.get_next_pieces(&hash, 2), vec![1, 2]);
        assert_eq!(scheduler.get_next_pieces(&hash, 2), vec![0]);
        assert!(scheduler.get_next_pieces(&hash, 2).is_empty());
    }

    #[test]
    fn test_sequential_example() {
        let (_, scheduler, hash) = setup(3);
        scheduler.set_mode(&hash, SelectionMode::Sequential);
        scheduler.update_peer_pieces(&hash, "p1", &PieceBitmap::from_indices(3, [0]));

        assert_eq!(scheduler.get_next_pieces(&hash, 2), vec![0, 1]);
    }

    #[test]
    fn test_never_returns_in_flight_or_available() {
        let (store, scheduler, hash) = setup(6);
        scheduler.set_mode(&hash, SelectionMode::Sequential);
        store.mark_piece_available(&hash, 1).unwrap();

        let first = scheduler.get_next_pieces(&hash, 2);
        assert_eq!(first, vec![0, 2]);
        let second = scheduler.get_next_pieces(&hash, 10);
        assert_eq!(second, vec![3, 4, 5]);
        assert_eq!(scheduler.in_flight_count(&hash), 5);
    }

    #[test]
    fn test_failed_piece_is_reselectable() {
        let (store, scheduler, hash) = setup(3);
        scheduler.set_mode(&hash, SelectionMode::Sequential);
        assert_eq!(scheduler.get_next_pieces(&hash, 3), vec![0, 1, 2]);

        scheduler.mark_piece_failed(&hash, 1);
        store.mark_piece_available(&hash, 0).unwrap();
        scheduler.mark_piece_completed(&hash, 0);

        assert!(!scheduler.is_in_flight(&hash, 1));
        assert_eq!(scheduler.get_next_pieces(&hash, 3), vec![1]);
    }

    #[test]
    fn test_reserve() {
        let (store, scheduler, hash) = setup(3);
        store.mark_piece_available(&hash, 0).unwrap();

        assert!(!scheduler.reserve(&hash, 0));
        assert!(scheduler.reserve(&hash, 2));
        assert!(!scheduler.reserve(&hash, 2));
        assert_eq!(scheduler.get_next_pieces(&hash, 3), vec![1]);
    }

    #[test]
    fn test_clear_schedule_keeps_mode() {
        let (_, scheduler, hash) = setup(3);
        scheduler.set_mode(&hash, SelectionMode::Sequential);
        scheduler.update_peer_pieces(&hash, "p", &PieceBitmap::full(3));
        scheduler.get_next_pieces(&hash, 2);

        scheduler.clear_schedule(&hash);
        assert_eq!(scheduler.in_flight_count(&hash), 0);
        assert_eq!(scheduler.rarity(&hash, 0), 0);
        assert_eq!(scheduler.mode(&hash), SelectionMode::Sequential);
    }

    #[test]
    fn test_unknown_file_yields_nothing() {
        let (_, scheduler, _) = setup(1);
        assert!(scheduler.get_next_pieces("unknown", 5).is_empty());
        assert!(sync::read(&scheduler.files).is_empty());
    }

    #[test]
    fn test_advertisement_for_unknown_file_keeps_no_state() {
        let (_, scheduler, _) = setup(1);
        for i in 0..100 {
            let bitmap = PieceBitmap::from_indices(8, [0, 7]);
            scheduler.update_peer_pieces(&format!("unknown-{}", i), "p", &bitmap);
        }
        assert!(sync::read(&scheduler.files).is_empty());
        assert_eq!(scheduler.rarity("unknown-0", 0), 0);
    }

    #[test]
    fn test_selection_mode_from_str() {
        assert_eq!("sequential".parse::<SelectionMode>().unwrap(), SelectionMode::Sequential);
        assert_eq!("Rarest-First".parse::<SelectionMode>().unwrap(), SelectionMode::RarestFirst);
        assert!("random".parse::<SelectionMode>().is_err());
    }
}
