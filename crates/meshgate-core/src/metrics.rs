//! Per-error-kind counters, shared via `Arc<Metrics>` passed to every
//! component at construction rather than a global (§9's "avoid ambient
//! globals" redesign note; §7's taxonomy of error kinds).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub received: AtomicU64,
    pub admitted: AtomicU64,
    pub transport_errors: AtomicU64,
    pub decode_structural_errors: AtomicU64,
    pub decode_encoding_errors: AtomicU64,
    pub crypto_errors: AtomicU64,
    pub semantic_errors: AtomicU64,
    pub overflow_errors: AtomicU64,
    pub duplicate_count: AtomicU64,
    pub rate_limited_count: AtomicU64,
    pub storage_errors: AtomicU64,
    pub shutdown_drops: AtomicU64,
    pub messages_failed: AtomicU64,
    pub unknown_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            decode_structural_errors: self.decode_structural_errors.load(Ordering::Relaxed),
            decode_encoding_errors: self.decode_encoding_errors.load(Ordering::Relaxed),
            crypto_errors: self.crypto_errors.load(Ordering::Relaxed),
            semantic_errors: self.semantic_errors.load(Ordering::Relaxed),
            overflow_errors: self.overflow_errors.load(Ordering::Relaxed),
            duplicate_count: self.duplicate_count.load(Ordering::Relaxed),
            rate_limited_count: self.rate_limited_count.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            shutdown_drops: self.shutdown_drops.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            unknown_count: self.unknown_count.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub admitted: u64,
    pub transport_errors: u64,
    pub decode_structural_errors: u64,
    pub decode_encoding_errors: u64,
    pub crypto_errors: u64,
    pub semantic_errors: u64,
    pub overflow_errors: u64,
    pub duplicate_count: u64,
    pub rate_limited_count: u64,
    pub storage_errors: u64,
    pub shutdown_drops: u64,
    pub messages_failed: u64,
    pub unknown_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.received);
        Metrics::incr(&metrics.received);
        Metrics::incr(&metrics.crypto_errors);
        let snap = metrics.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.crypto_errors, 1);
    }
}
