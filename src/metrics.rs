use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Point-in-time counters of a throttler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub submitted: u64,
    pub bypassed: u64,
    pub admitted: u64,
    pub queued: u64,
    /// Queued items that left the queue through a drain, either admitted or
    /// answered by the bypass predicate
    pub drained: u64,
    pub windows_opened: u64,
    pub queue_len: u64,
    pub started_at: u64,
}

#[derive(Debug)]
pub(crate) struct MetricsCollector {
    submitted: AtomicU64,
    bypassed: AtomicU64,
    admitted: AtomicU64,
    queued: AtomicU64,
    drained: AtomicU64,
    windows_opened: AtomicU64,
    started_at: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            windows_opened: AtomicU64::new(0),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drained(&self, count: usize) {
        self.drained.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_window_opened(&self) {
        self.windows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_len: usize) -> ThrottleMetrics {
        ThrottleMetrics {
            submitted: self.submitted.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            windows_opened: self.windows_opened.load(Ordering::Relaxed),
            queue_len: queue_len as u64,
            started_at: self.started_at,
        }
    }
}
