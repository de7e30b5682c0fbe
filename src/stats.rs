//! # Stats
//!
//! Hit/miss and admission counters for both subsystems. Read-only and
//! informational, served by the `/stats` route.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct CacheStats {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl CacheStats {
    pub fn local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_miss(&self) {
        self.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_hit(&self) {
        self.remote_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_miss(&self) {
        self.remote_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, local_len: usize, local_capacity: usize) -> CacheStatsSnapshot {
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let local_misses = self.local_misses.load(Ordering::Relaxed);
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        let remote_misses = self.remote_misses.load(Ordering::Relaxed);

        CacheStatsSnapshot {
            local_hits,
            local_misses,
            remote_hits,
            remote_misses,
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            hit_rate: rate(local_hits + remote_hits, local_misses + remote_misses),
            local_entries: local_len,
            local_capacity,
            local_utilization: if local_capacity == 0 {
                0.0
            } else {
                local_len as f64 / local_capacity as f64
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheStatsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,
    pub remote_errors: u64,
    pub hit_rate: f64,
    pub local_entries: usize,
    pub local_capacity: usize,
    pub local_utilization: f64,
}

#[derive(Default)]
pub struct LimiterStats {
    allowed: AtomicU64,
    rejected: AtomicU64,
    failed_open: AtomicU64,
}

impl LimiterStats {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_open(&self) {
        self.failed_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, tracked_identifiers: usize) -> LimiterStatsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);

        LimiterStatsSnapshot {
            allowed,
            rejected,
            failed_open: self.failed_open.load(Ordering::Relaxed),
            rejection_rate: rate(rejected, allowed),
            tracked_identifiers,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LimiterStatsSnapshot {
    pub allowed: u64,
    pub rejected: u64,
    pub failed_open: u64,
    pub rejection_rate: f64,
    pub tracked_identifiers: usize,
}

fn rate(part: u64, rest: u64) -> f64 {
    let total = part + rest;
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheStats, LimiterStats};

    #[test]
    fn test_cache_snapshot_counts() {
        let stats = CacheStats::default();
        stats.local_hit();
        stats.local_hit();
        stats.local_miss();
        stats.remote_hit();
        stats.remote_error();

        let snap = stats.snapshot(50, 100);
        assert_eq!(snap.local_hits, 2);
        assert_eq!(snap.local_misses, 1);
        assert_eq!(snap.remote_hits, 1);
        assert_eq!(snap.remote_errors, 1);
        assert_eq!(snap.local_utilization, 0.5);
        assert_eq!(snap.hit_rate, 0.75);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let cache = CacheStats::default();
        assert_eq!(cache.snapshot(0, 0).hit_rate, 0.0);

        let limiter = LimiterStats::default();
        assert_eq!(limiter.snapshot(0).rejection_rate, 0.0);
    }

    #[test]
    fn test_limiter_snapshot_counts() {
        let stats = LimiterStats::default();
        stats.record_allowed();
        stats.record_allowed();
        stats.record_allowed();
        stats.record_rejected();
        stats.record_failed_open();

        let snap = stats.snapshot(2);
        assert_eq!(snap.allowed, 3);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.failed_open, 1);
        assert_eq!(snap.rejection_rate, 0.25);
        assert_eq!(snap.tracked_identifiers, 2);
    }
}
