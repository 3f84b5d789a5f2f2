//! Transfer sessions
//!
//! One session per active download. It carries the cooperative
//! cancellation flag and resolves the caller's `DownloadHandle` once.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use crate::sync;

/// How a download ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadOutcome::Completed => write!(f, "completed"),
            DownloadOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            DownloadOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of one active download
pub struct TransferSession {
    file_hash: String,
    output: PathBuf,
    cancelled: AtomicBool,
    verifying: AtomicBool,
    peer_cursor: AtomicUsize,
    retries: Mutex<HashMap<u32, u32>>,
    /// Serializes batch selection so the in-flight cap holds
    pub(crate) schedule_lock: Mutex<()>,
    /// Serializes checkpoint writes and the final delete
    pub(crate) checkpoint_lock: tokio::sync::Mutex<()>,
    outcome: watch::Sender<Option<DownloadOutcome>>,
}

impl TransferSession {
    pub fn new(file_hash: impl Into<String>, output: PathBuf) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            file_hash: file_hash.into(),
            output,
            cancelled: AtomicBool::new(false),
            verifying: AtomicBool::new(false),
            peer_cursor: AtomicUsize::new(0),
            retries: Mutex::new(HashMap::new()),
            schedule_lock: Mutex::new(()),
            checkpoint_lock: tokio::sync::Mutex::new(()),
            outcome,
        }
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Claim whole-file verification; only the first caller wins
    pub fn begin_verification(&self) -> bool {
        self.verifying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Round-robin index into a peer list of `len` entries
    pub fn next_peer(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.peer_cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Count one more failed attempt for a piece and return the total
    pub fn record_failure(&self, index: u32) -> u32 {
        let mut retries = sync::lock(&self.retries);
        let count = retries.entry(index).or_insert(0);
        *count += 1;
        *count
    }

    /// Resolve the outcome; returns false if it was already resolved
    pub fn finish(&self, outcome: DownloadOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Handle for waiting on the outcome
    pub fn handle(&self) -> DownloadHandle {
        DownloadHandle {
            file_hash: self.file_hash.clone(),
            outcome: self.outcome.subscribe(),
        }
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("file_hash", &self.file_hash)
            .field("output", &self.output)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Caller's view of a download
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    file_hash: String,
    outcome: watch::Receiver<Option<DownloadOutcome>>,
}

impl DownloadHandle {
    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    /// Outcome if already resolved
    pub fn outcome(&self) -> Option<DownloadOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the download completes, fails or is cancelled
    pub async fn wait(mut self) -> DownloadOutcome {
        loop {
            let current = self.outcome.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                let last = self.outcome.borrow().clone();
                return last.unwrap_or_else(|| DownloadOutcome::Failed("transfer session dropped".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let session = TransferSession::new("f", PathBuf::from("out"));
        let handle = session.handle();
        assert_eq!(handle.outcome(), None);

        assert!(session.finish(DownloadOutcome::Cancelled));
        assert!(!session.finish(DownloadOutcome::Completed));
        assert!(session.is_finished());
        assert_eq!(handle.wait().await, DownloadOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_after_session_dropped() {
        let session = TransferSession::new("f", PathBuf::from("out"));
        let handle = session.handle();
        session.finish(DownloadOutcome::Completed);
        drop(session);
        assert_eq!(handle.wait().await, DownloadOutcome::Completed);

        let session = TransferSession::new("g", PathBuf::from("out"));
        let handle = session.handle();
        drop(session);
        assert!(matches!(handle.wait().await, DownloadOutcome::Failed(_)));
    }

    #[test]
    fn test_bookkeeping() {
        let session = TransferSession::new("f", PathBuf::from("out"));
        assert!(session.begin_verification());
        assert!(!session.begin_verification());

        assert_eq!(session.record_failure(3), 1);
        assert_eq!(session.record_failure(3), 2);
        assert_eq!(session.record_failure(4), 1);

        let picks: Vec<usize> = (0..4).map(|_| session.next_peer(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
        assert_eq!(session.next_peer(0), 0);

        assert!(!session.is_cancelled());
        session.cancel();
        assert!(session.is_cancelled());
    }
}
