//! Transfer statistics
//!
//! Lock-free counters for the data path plus per-file UDP loss accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::sync;

/// Point-in-time copy of the transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_sends: u64,
    pub active_receives: u64,
    pub total_sends: u64,
    pub total_receives: u64,
    pub failed_sends: u64,
    pub failed_receives: u64,
    /// UDP operations that were retried over TCP
    pub fallbacks: u64,
}

/// Running transfer counters
#[derive(Debug, Default)]
pub struct TransferCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_sends: AtomicU64,
    active_receives: AtomicU64,
    total_sends: AtomicU64,
    total_receives: AtomicU64,
    failed_sends: AtomicU64,
    failed_receives: AtomicU64,
    fallbacks: AtomicU64,
}

/// Decrements an active counter when dropped
pub struct ActiveGuard<'a> {
    counter: &'a AtomicU64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl TransferCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a send and keep it active until the guard drops
    pub fn begin_send(&self) -> ActiveGuard<'_> {
        self.total_sends.fetch_add(1, Ordering::Relaxed);
        self.active_sends.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { counter: &self.active_sends }
    }

    /// Count a receive and keep it active until the guard drops
    pub fn begin_receive(&self) -> ActiveGuard<'_> {
        self.total_receives.fetch_add(1, Ordering::Relaxed);
        self.active_receives.fetch_add(1, Ordering::Relaxed);
        ActiveGuard { counter: &self.active_receives }
    }

    pub fn add_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receive_failed(&self) {
        self.failed_receives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_sends: self.active_sends.load(Ordering::Relaxed),
            active_receives: self.active_receives.load(Ordering::Relaxed),
            total_sends: self.total_sends.load(Ordering::Relaxed),
            total_receives: self.total_receives.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            failed_receives: self.failed_receives.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct LossCounter {
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl LossCounter {
    fn rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.failures.load(Ordering::Relaxed) as f64 / attempts as f64
    }
}

/// UDP failure ratio per file
#[derive(Debug, Default)]
pub struct LossTracker {
    files: RwLock<HashMap<String, Arc<LossCounter>>>,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, file_hash: &str) -> Arc<LossCounter> {
        if let Some(counter) = sync::read(&self.files).get(file_hash) {
            return Arc::clone(counter);
        }
        Arc::clone(sync::write(&self.files).entry(file_hash.to_string()).or_default())
    }

    /// Count a UDP attempt for a file
    pub fn record_attempt(&self, file_hash: &str) {
        self.counter(file_hash).attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a UDP failure and return the updated loss rate
    pub fn record_failure(&self, file_hash: &str) -> f64 {
        let counter = self.counter(file_hash);
        counter.failures.fetch_add(1, Ordering::Relaxed);
        counter.rate()
    }

    /// Failures over attempts, 0.0 for unknown files
    pub fn loss_rate(&self, file_hash: &str) -> f64 {
        sync::read(&self.files)
            .get(file_hash)
            .map(|c| c.rate())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard() {
        let counters = TransferCounters::new();
        {
            let _send = counters.begin_send();
            let _recv = counters.begin_receive();
            let stats = counters.snapshot();
            assert_eq!(stats.active_sends, 1);
            assert_eq!(stats.active_receives, 1);
        }
        counters.add_bytes_sent(10);
        counters.send_failed();

        let stats = counters.snapshot();
        assert_eq!(stats.active_sends, 0);
        assert_eq!(stats.active_receives, 0);
        assert_eq!(stats.total_sends, 1);
        assert_eq!(stats.total_receives, 1);
        assert_eq!(stats.bytes_sent, 10);
        assert_eq!(stats.failed_sends, 1);
    }

    #[test]
    fn test_loss_rate() {
        let tracker = LossTracker::new();
        assert_eq!(tracker.loss_rate("f"), 0.0);

        for _ in 0..4 {
            tracker.record_attempt("f");
        }
        assert_eq!(tracker.record_failure("f"), 0.25);
        assert_eq!(tracker.record_failure("f"), 0.5);
        assert_eq!(tracker.loss_rate("g"), 0.0);
    }
}
