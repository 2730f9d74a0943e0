//! Metrics Collection Module
//!
//! Atomic counters for the read and invalidation paths. Counters are shared through
//! `Arc` and may be read by the HTTP server while the worker updates them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Proxy counters
#[derive(Debug)]
pub struct ProxyMetrics {
    read_requests: AtomicU64,
    invalidation_requests: AtomicU64,
    mcc_hits: AtomicU64,
    mcc_hit_items: AtomicU64,
    db_reads: AtomicU64,
    db_read_items: AtomicU64,
    obsolete_evictions: AtomicU64,
    lru_evictions: AtomicU64,
    size_overshoots: AtomicU64,
    failed_tasks: AtomicU64,
    started_at: SystemTime,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub read_requests: u64,
    pub invalidation_requests: u64,
    pub mcc_hits: u64,
    pub mcc_hit_items: u64,
    pub db_reads: u64,
    pub db_read_items: u64,
    pub obsolete_evictions: u64,
    pub lru_evictions: u64,
    pub size_overshoots: u64,
    pub failed_tasks: u64,
    pub uptime_seconds: u64,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            read_requests: AtomicU64::new(0),
            invalidation_requests: AtomicU64::new(0),
            mcc_hits: AtomicU64::new(0),
            mcc_hit_items: AtomicU64::new(0),
            db_reads: AtomicU64::new(0),
            db_read_items: AtomicU64::new(0),
            obsolete_evictions: AtomicU64::new(0),
            lru_evictions: AtomicU64::new(0),
            size_overshoots: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            started_at: SystemTime::now(),
        }
    }

    pub fn record_read_request(&self) {
        self.read_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_request(&self) {
        self.invalidation_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A read served entirely from the cache
    pub fn record_mcc_hit(&self, items: usize) {
        self.mcc_hits.fetch_add(1, Ordering::Relaxed);
        self.mcc_hit_items.fetch_add(items as u64, Ordering::Relaxed);
    }

    /// One database batch read covering `items` keys
    pub fn record_db_read(&self, items: usize) {
        self.db_reads.fetch_add(1, Ordering::Relaxed);
        self.db_read_items.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, obsolete: usize, lru: usize) {
        self.obsolete_evictions
            .fetch_add(obsolete as u64, Ordering::Relaxed);
        self.lru_evictions.fetch_add(lru as u64, Ordering::Relaxed);
    }

    pub fn record_size_overshoot(&self) {
        self.size_overshoots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_task(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_requests: self.read_requests.load(Ordering::Relaxed),
            invalidation_requests: self.invalidation_requests.load(Ordering::Relaxed),
            mcc_hits: self.mcc_hits.load(Ordering::Relaxed),
            mcc_hit_items: self.mcc_hit_items.load(Ordering::Relaxed),
            db_reads: self.db_reads.load(Ordering::Relaxed),
            db_read_items: self.db_read_items.load(Ordering::Relaxed),
            obsolete_evictions: self.obsolete_evictions.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            size_overshoots: self.size_overshoots.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            uptime_seconds: self
                .started_at
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.read_requests,
            &self.invalidation_requests,
            &self.mcc_hits,
            &self.mcc_hit_items,
            &self.db_reads,
            &self.db_read_items,
            &self.obsolete_evictions,
            &self.lru_evictions,
            &self.size_overshoots,
            &self.failed_tasks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_and_reset() {
        let metrics = ProxyMetrics::new();
        metrics.record_read_request();
        metrics.record_mcc_hit(3);
        metrics.record_db_read(2);
        metrics.record_db_read(5);
        metrics.record_evictions(1, 4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.read_requests, 1);
        assert_eq!(snapshot.mcc_hits, 1);
        assert_eq!(snapshot.mcc_hit_items, 3);
        assert_eq!(snapshot.db_reads, 2);
        assert_eq!(snapshot.db_read_items, 7);
        assert_eq!(snapshot.obsolete_evictions, 1);
        assert_eq!(snapshot.lru_evictions, 4);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.db_reads, 0);
        assert_eq!(snapshot.mcc_hit_items, 0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(ProxyMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_db_read(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().db_reads, 4000);
        assert_eq!(metrics.snapshot().db_read_items, 4000);
    }
}
