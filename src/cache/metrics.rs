//! Cache Metrics
//!
//! Cache-line aligned counters per tier. Statistics are advisory: nothing
//! in the engine reads them to make decisions.

use crate::cache::events::InvalidationCause;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Tier
// =============================================================================

/// Tier a counter set belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Disk,
    Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Disk => write!(f, "disk"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

// =============================================================================
// Per-Tier Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for a single tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TierMetrics {
    /// Lookups answered by this tier
    pub hits: AtomicU64,
    /// Lookups this tier could not answer
    pub misses: AtomicU64,
    /// Entries written into this tier
    pub writes: AtomicU64,
    /// Entries removed from this tier
    pub removals: AtomicU64,
    /// Entries evicted for capacity
    pub evictions: AtomicU64,
    /// Entries moved down to the next tier
    pub spills: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<TierMetrics>() <= CACHE_LINE_SIZE);

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TierMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            spills: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_spill(&self) {
        self.spills.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time snapshot of tier metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub removals: u64,
    pub evictions: u64,
    pub spills: u64,
}

impl TierMetricsSnapshot {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Aggregate statistics for one cache instance
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub memory: TierMetricsSnapshot,
    pub disk: TierMetricsSnapshot,
    pub remote: TierMetricsSnapshot,
    /// Invalidations per cause, indexed by [`InvalidationCause::index`]
    pub invalidations: [u64; 6],
    pub promotions: u64,
    pub overflow_allocations: u64,
    pub disk_write_failures: u64,
    /// Entries currently in memory
    pub memory_entries: u64,
    /// Records currently on disk
    pub disk_entries: u64,
    /// Bytes currently accounted on disk
    pub disk_bytes: u64,
}

impl CacheStatsSnapshot {
    /// Overall hit ratio (a lookup misses only when every tier missed)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.memory.hits + self.disk.hits + self.remote.hits;
        let total = self.memory.hits + self.memory.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Invalidations recorded for a cause
    pub fn invalidations_for(&self, cause: InvalidationCause) -> u64 {
        self.invalidations[cause.index()]
    }
}

// =============================================================================
// Global Cache Metrics
// =============================================================================

/// Counters for one cache instance
#[derive(Debug)]
pub struct CacheMetrics {
    pub memory: TierMetrics,
    pub disk: TierMetrics,
    pub remote: TierMetrics,
    invalidations: [AtomicU64; 6],
    promotions: AtomicU64,
    disk_write_failures: AtomicU64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self {
            memory: TierMetrics::new(),
            disk: TierMetrics::new(),
            remote: TierMetrics::new(),
            invalidations: Default::default(),
            promotions: AtomicU64::new(0),
            disk_write_failures: AtomicU64::new(0),
        }
    }

    /// Get metrics for a specific tier
    pub fn tier(&self, tier: Tier) -> &TierMetrics {
        match tier {
            Tier::Memory => &self.memory,
            Tier::Disk => &self.disk,
            Tier::Remote => &self.remote,
        }
    }

    pub fn record_invalidation(&self, cause: InvalidationCause) {
        self.invalidations[cause.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_write_failure(&self) {
        self.disk_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot; gauges are supplied by the caller
    pub fn snapshot(
        &self,
        memory_entries: u64,
        overflow_allocations: u64,
        disk_entries: u64,
        disk_bytes: u64,
    ) -> CacheStatsSnapshot {
        let mut invalidations = [0u64; 6];
        for (slot, counter) in invalidations.iter_mut().zip(self.invalidations.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        CacheStatsSnapshot {
            memory: self.memory.snapshot(),
            disk: self.disk.snapshot(),
            remote: self.remote.snapshot(),
            invalidations,
            promotions: self.promotions.load(Ordering::Relaxed),
            overflow_allocations,
            disk_write_failures: self.disk_write_failures.load(Ordering::Relaxed),
            memory_entries,
            disk_entries,
            disk_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<TierMetrics>(), CACHE_LINE_SIZE);
        assert!(std::mem::size_of::<TierMetrics>() <= CACHE_LINE_SIZE);
    }

    #[test]
    fn test_tier_metrics_operations() {
        let metrics = TierMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_spill();

        let snap = metrics.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.spills, 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_cache_metrics_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.tier(Tier::Memory).record_miss();
        metrics.tier(Tier::Disk).record_hit();
        metrics.record_invalidation(InvalidationCause::Timeout);
        metrics.record_invalidation(InvalidationCause::Timeout);
        metrics.record_promotion();

        let snap = metrics.snapshot(3, 1, 10, 5120);
        assert_eq!(snap.invalidations_for(InvalidationCause::Timeout), 2);
        assert_eq!(snap.invalidations_for(InvalidationCause::Explicit), 0);
        assert_eq!(snap.promotions, 1);
        assert_eq!(snap.memory_entries, 3);
        assert_eq!(snap.disk_bytes, 5120);
        assert!((snap.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }
}
