use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide relay counters, updated lock-free by every exchange.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    requests_total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    response_bytes_total: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_bytes(&self, bytes: u64) {
        self.response_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            response_bytes_total: self.response_bytes_total.load(Ordering::Relaxed),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub requests_total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub response_bytes_total: u64,
    pub timestamp: u64,
}

impl MetricsSummary {
    /// Exchanges that reached a terminal phase.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
