//! Per-area counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by an area database. Shared with the store front so
/// counter reads never hop onto the area actor.
#[derive(Debug, Default)]
pub struct AreaMetrics {
    pub received_publications: AtomicU64,
    pub received_key_vals: AtomicU64,
    pub updated_key_vals: AtomicU64,
    pub redundant_publications: AtomicU64,
    pub looped_publications: AtomicU64,
    pub filtered_keys: AtomicU64,
    pub expired_key_vals: AtomicU64,
    pub full_sync_started: AtomicU64,
    pub full_sync_success: AtomicU64,
    pub full_sync_failure: AtomicU64,
    pub finalize_sync_sent: AtomicU64,
    pub flood_publications: AtomicU64,
    pub flood_failures: AtomicU64,
    pub rate_limit_suppressions: AtomicU64,
    pub stale_responses: AtomicU64,
}

impl AreaMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AreaMetricsSnapshot {
        AreaMetricsSnapshot {
            received_publications: self.received_publications.load(Ordering::Relaxed),
            received_key_vals: self.received_key_vals.load(Ordering::Relaxed),
            updated_key_vals: self.updated_key_vals.load(Ordering::Relaxed),
            redundant_publications: self.redundant_publications.load(Ordering::Relaxed),
            looped_publications: self.looped_publications.load(Ordering::Relaxed),
            filtered_keys: self.filtered_keys.load(Ordering::Relaxed),
            expired_key_vals: self.expired_key_vals.load(Ordering::Relaxed),
            full_sync_started: self.full_sync_started.load(Ordering::Relaxed),
            full_sync_success: self.full_sync_success.load(Ordering::Relaxed),
            full_sync_failure: self.full_sync_failure.load(Ordering::Relaxed),
            finalize_sync_sent: self.finalize_sync_sent.load(Ordering::Relaxed),
            flood_publications: self.flood_publications.load(Ordering::Relaxed),
            flood_failures: self.flood_failures.load(Ordering::Relaxed),
            rate_limit_suppressions: self.rate_limit_suppressions.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AreaMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaMetricsSnapshot {
    pub received_publications: u64,
    pub received_key_vals: u64,
    pub updated_key_vals: u64,
    pub redundant_publications: u64,
    pub looped_publications: u64,
    pub filtered_keys: u64,
    pub expired_key_vals: u64,
    pub full_sync_started: u64,
    pub full_sync_success: u64,
    pub full_sync_failure: u64,
    pub finalize_sync_sent: u64,
    pub flood_publications: u64,
    pub flood_failures: u64,
    pub rate_limit_suppressions: u64,
    pub stale_responses: u64,
}
