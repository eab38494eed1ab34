//! Disk Cleanup and Garbage Collection
//!
//! Background passes over the disk tier. Each pass is guarded so at most
//! one instance of it runs per cache, and every loop checks the stopping
//! flag between batches.
//!
//! - **drain**: physically deletes buffered ids in batches of
//!   [`NUM_SCAN`]
//! - **cleanup**: scans the object table for expired records, queues them
//!   and drains
//! - **gc**: when a limit passes its high watermark, reclaims expired
//!   records first, then walks the eviction heap down to the low watermark
//!   and drains the victims

use super::{BufferKind, DiskCache};
use crate::cache::disk::layout::DiskProperties;
use crate::cache::entry::now_millis;
use crate::cache::events::{CacheEvent, InvalidationCause, Source};
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ids physically deleted per batch
pub const NUM_SCAN: usize = 50;

/// Delay used when a cleanup is already overdue
const OVERDUE_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Statistics
// =============================================================================

/// Records deleted by one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub explicit: u64,
    pub scan: u64,
    pub garbage_collected: u64,
    pub bytes_freed: u64,
}

impl DrainStats {
    fn record(&mut self, kind: BufferKind, bytes: u64) {
        match kind {
            BufferKind::Explicit => self.explicit += 1,
            BufferKind::Scan => self.scan += 1,
            BufferKind::GarbageCollector => self.garbage_collected += 1,
        }
        self.bytes_freed += bytes;
    }

    pub fn total(&self) -> u64 {
        self.explicit + self.scan + self.garbage_collected
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub expired_found: u64,
    pub drained: DrainStats,
}

/// Outcome of one garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Expired records reclaimed ahead of the policy
    pub expired: u64,
    /// Records chosen by the eviction policy
    pub victims: u64,
    pub drained: DrainStats,
}

/// Clears a running flag on drop
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Scheduling
// =============================================================================

/// Time until the next cleanup pass
///
/// With a positive `frequency_mins` the pass is due that long after the
/// last scan. With a zero frequency it runs daily at `hour` (UTC).
pub fn calculate_sleep_time(now: DateTime<Utc>, last_scan_ms: Option<i64>, frequency_mins: u32, hour: u8) -> Duration {
    let now_ms = now.timestamp_millis();
    let next_ms = if frequency_mins > 0 {
        last_scan_ms.unwrap_or(now_ms) + i64::from(frequency_mins) * 60_000
    } else {
        let today = now
            .date_naive()
            .and_hms_opt(u32::from(hour.min(23)), 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let next = if today <= now { today + ChronoDuration::days(1) } else { today };
        next.timestamp_millis()
    };
    if next_ms <= now_ms {
        return OVERDUE_DELAY;
    }
    Duration::from_millis((next_ms - now_ms) as u64)
}

// =============================================================================
// Passes
// =============================================================================

impl DiskCache {
    /// Physically delete buffered ids in batches
    ///
    /// With `honor_stop` the loop exits between batches once the instance
    /// is stopping.
    pub fn drain(&self, prefer_explicit: bool, honor_stop: bool) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        loop {
            if honor_stop && self.is_stopping() {
                debug!(cache = %self.name, "drain interrupted by stop");
                break;
            }
            let mut store = self.store.write();
            let Some((kind, ids)) = self.invalidations.lock().pop_next_batch(prefer_explicit, NUM_SCAN) else {
                break;
            };
            for (done, id) in ids.iter().enumerate() {
                let removed = store.remove_record(id);
                match removed {
                    Ok(Some(header)) => {
                        self.heap.lock().remove_id(&header.key);
                        stats.record(kind, header.size);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Unprocessed ids stay buffered so readers keep missing them
                        let requeued = self.invalidations.lock().add_all(&ids[done..], kind);
                        drop(store);
                        warn!(cache = %self.name, id = %id, requeued, error = %e, "drain interrupted");
                        self.record_drain(&stats);
                        return Err(e);
                    }
                }
            }
        }
        self.record_drain(&stats);
        Ok(stats)
    }

    fn record_drain(&self, stats: &DrainStats) {
        if stats.total() > 0 {
            self.metrics.disk.removals.fetch_add(stats.total(), Ordering::Relaxed);
            debug!(
                cache = %self.name,
                explicit = stats.explicit,
                scan = stats.scan,
                gc = stats.garbage_collected,
                bytes = stats.bytes_freed,
                "invalidation buffer drained"
            );
        }
    }

    /// Scan for expired records and drain the buffer
    ///
    /// Returns `None` if a cleanup pass is already running.
    pub fn run_cleanup(&self) -> Result<Option<CleanupStats>> {
        let Some(_guard) = RunGuard::acquire(&self.cleanup_running) else {
            return Ok(None);
        };
        if !self.is_enabled() {
            return Ok(Some(CleanupStats::default()));
        }
        let now = now_millis();
        let expired = self.store.read().expired_ids(now);
        self.invalidations.lock().add_all(&expired, BufferKind::Scan);
        for id in &expired {
            self.metrics.record_invalidation(InvalidationCause::Timeout);
            self.emit(CacheEvent::invalidated(id, InvalidationCause::Timeout, Source::Disk, None));
        }

        let drained = self.drain(false, true)?;
        self.last_scan.store(now, Ordering::Release);
        if let Err(e) = self.layout.write_last_scan(now) {
            warn!(cache = %self.name, error = %e, "could not record last scan time");
        }

        let stats = CleanupStats {
            expired_found: expired.len() as u64,
            drained,
        };
        info!(
            cache = %self.name,
            expired = stats.expired_found,
            explicit = drained.explicit,
            scan = drained.scan,
            gc = drained.garbage_collected,
            "disk cleanup completed"
        );
        self.emit(CacheEvent::CleanupCompleted {
            explicit: drained.explicit,
            scan: drained.scan,
            garbage_collected: drained.garbage_collected,
            expired_found: stats.expired_found,
        });
        Ok(Some(stats))
    }

    /// Entries and bytes to free, if either limit is past its high watermark
    pub fn gc_target(&self) -> Option<(usize, u64)> {
        let high = u64::from(self.config.high_threshold);
        let low = u64::from(self.config.low_threshold);
        let store = self.store.read();
        let (len, bytes) = (store.len() as u64, store.bytes());
        let (entry_limit, byte_limit) = (store.entry_limit(), store.byte_limit());

        let entries = if entry_limit > 0 && len * 100 >= entry_limit * high {
            len.saturating_sub(entry_limit * low / 100)
        } else {
            0
        };
        let bytes = if byte_limit > 0 && bytes * 100 >= byte_limit * high {
            bytes.saturating_sub(byte_limit * low / 100)
        } else {
            0
        };
        (entries > 0 || bytes > 0).then_some((entries as usize, bytes))
    }

    /// Trim the tier down to the low watermark
    ///
    /// Returns `None` if a pass is already running or nothing needs to go.
    pub fn run_gc(&self) -> Result<Option<GcStats>> {
        let Some(_guard) = RunGuard::acquire(&self.gc_running) else {
            return Ok(None);
        };
        if !self.is_enabled() {
            return Ok(None);
        }
        let Some((entries, bytes)) = self.gc_target() else {
            return Ok(None);
        };

        let now = now_millis();
        let (expired, victims) = {
            let mut heap = self.heap.lock();
            let expired = heap.pop_expired(now);
            let freed_bytes: u64 = expired.iter().map(|e| e.size).sum();
            let victims = heap.walk(
                self.config.eviction_policy,
                now,
                entries.saturating_sub(expired.len()),
                bytes.saturating_sub(freed_bytes),
            );
            (expired, victims)
        };
        {
            let mut buffer = self.invalidations.lock();
            buffer.add_all(expired.iter().map(|e| &e.id), BufferKind::Scan);
            buffer.add_all(victims.iter().map(|v| &v.id), BufferKind::GarbageCollector);
        }
        for entry in &expired {
            self.metrics.record_invalidation(InvalidationCause::Timeout);
            self.emit(CacheEvent::invalidated(&entry.id, InvalidationCause::Timeout, Source::Disk, None));
        }
        for victim in &victims {
            self.metrics.disk.record_eviction();
            self.metrics.record_invalidation(InvalidationCause::DiskGarbageCollected);
            self.emit(CacheEvent::invalidated(
                &victim.id,
                InvalidationCause::DiskGarbageCollected,
                Source::Disk,
                None,
            ));
        }

        let drained = self.drain(false, true)?;
        let stats = GcStats {
            expired: expired.len() as u64,
            victims: victims.len() as u64,
            drained,
        };
        info!(
            cache = %self.name,
            policy = %self.config.eviction_policy,
            expired = stats.expired,
            victims = stats.victims,
            bytes_freed = drained.bytes_freed,
            "disk garbage collection completed"
        );
        self.emit(CacheEvent::GarbageCollected {
            entries_removed: stats.expired + stats.victims,
            bytes_freed: drained.bytes_freed,
        });
        Ok(Some(stats))
    }

    /// Run a cleanup pass on the scheduler unless one is running
    pub fn invoke_cleanup(self: &Arc<Self>) -> bool {
        if self.cleanup_running.load(Ordering::Acquire) || self.is_stopping() {
            return false;
        }
        let disk = Arc::clone(self);
        self.scheduler.submit(Box::new(move || {
            if let Err(e) = disk.run_cleanup() {
                warn!(cache = %disk.name, error = %e, "disk cleanup failed");
            }
        }));
        true
    }

    /// Run garbage collection on the scheduler if a watermark was passed
    pub fn invoke_gc_if_necessary(self: &Arc<Self>) -> bool {
        if self.gc_running.load(Ordering::Acquire) || self.is_stopping() || self.gc_target().is_none() {
            return false;
        }
        let disk = Arc::clone(self);
        self.scheduler.submit(Box::new(move || {
            if let Err(e) = disk.run_gc() {
                warn!(cache = %disk.name, error = %e, "disk garbage collection failed");
            }
        }));
        true
    }

    /// Arm the next periodic cleanup pass
    pub fn schedule_cleanup(self: &Arc<Self>) {
        if self.is_stopping() || !self.is_enabled() {
            return;
        }
        let delay = calculate_sleep_time(
            Utc::now(),
            Some(self.last_scan.load(Ordering::Acquire)),
            self.config.cleanup_frequency_mins,
            self.config.cleanup_hour,
        );
        debug!(cache = %self.name, delay_secs = delay.as_secs(), "next disk cleanup scheduled");
        let disk = Arc::downgrade(self);
        self.scheduler.schedule_once(
            delay,
            Box::new(move || {
                let Some(disk) = disk.upgrade() else {
                    return;
                };
                if let Err(e) = disk.run_cleanup() {
                    warn!(cache = %disk.name, error = %e, "disk cleanup failed");
                }
                disk.schedule_cleanup();
            }),
        );
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Ask in-flight passes to exit at their next batch boundary
    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Whether a cleanup or gc pass is still running
    pub fn is_busy(&self) -> bool {
        self.cleanup_running.load(Ordering::Acquire) || self.gc_running.load(Ordering::Acquire)
    }

    /// Flush buffers, settle pending deletes and mark a clean shutdown
    ///
    /// Pending explicit invalidations above `explicit_buffer_limit_on_stop`
    /// make it cheaper to clear the tier than to drain it.
    pub fn finish_stop(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let flushed = self.flush_tags()?;
        let pending = self.pending_invalidations();
        let limit = self.config.explicit_buffer_limit_on_stop;
        if limit > 0 && pending.explicit > limit {
            warn!(
                cache = %self.name,
                pending = pending.explicit,
                limit,
                "too many pending invalidations at stop, clearing disk tier"
            );
            self.clear()?;
        } else {
            self.drain(true, false)?;
        }

        let props = {
            let store = self.store.read();
            DiskProperties::new(
                &self.name,
                store.len() as u64,
                store.bytes(),
                store.dependencies.is_disabled(),
                store.templates.is_disabled(),
            )
        };
        self.layout.write_properties(&props)?;
        self.layout.write_last_scan(self.last_scan.load(Ordering::Acquire))?;
        self.layout.clear_in_progress()?;
        info!(
            cache = %self.name,
            entries = props.entries,
            bytes = props.bytes,
            tags_flushed = flushed,
            "disk tier stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::tests::open_disk;
    use crate::cache::disk::{DiskEvictionPolicy, TagKind};
    use chrono::TimeZone;
    use crate::cache::entry::CacheEntry;
    use crate::config::DiskConfig;
    use tempfile::TempDir;

    #[test]
    fn test_sleep_time_by_frequency() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let last = now.timestamp_millis() - 10 * 60_000;
        assert_eq!(calculate_sleep_time(now, Some(last), 30, 0), Duration::from_secs(20 * 60));
        assert_eq!(calculate_sleep_time(now, Some(last), 5, 0), OVERDUE_DELAY);
        assert_eq!(calculate_sleep_time(now, None, 15, 0), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_sleep_time_by_hour() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(calculate_sleep_time(now, None, 0, 12), Duration::from_secs(90 * 60));
        assert_eq!(
            calculate_sleep_time(now, None, 0, 9),
            Duration::from_secs((22 * 60 + 30) * 60)
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(&dir, DiskConfig::default());
        let mut expired = CacheEntry::new("old", "v");
        expired.expiration_time = now_millis() - 1;
        disk.write(&expired).unwrap();
        disk.write(&CacheEntry::new("fresh", "v")).unwrap();

        let stats = disk.run_cleanup().unwrap().unwrap();
        assert_eq!(stats.expired_found, 1);
        assert_eq!(stats.drained.scan, 1);
        assert_eq!(disk.len(), 1);
        assert!(disk.layout().read_last_scan().is_some());
    }

    #[tokio::test]
    async fn test_gc_trims_to_low_watermark() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(
            &dir,
            DiskConfig {
                size_limit_entries: 10,
                eviction_policy: DiskEvictionPolicy::SizeBased,
                ..Default::default()
            },
        );
        for i in 0..8 {
            disk.write(&CacheEntry::new(format!("e{}", i), "v")).unwrap();
        }
        assert_eq!(disk.gc_target(), Some((1, 0)));

        let stats = disk.run_gc().unwrap().unwrap();
        assert_eq!(stats.victims, 1);
        assert_eq!(disk.len(), 7);
        assert!(disk.gc_target().is_none());
        assert!(disk.run_gc().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gc_reclaims_expired_before_policy() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(
            &dir,
            DiskConfig {
                size_limit_entries: 10,
                eviction_policy: DiskEvictionPolicy::None,
                ..Default::default()
            },
        );
        let mut stale = CacheEntry::new("stale", "v");
        stale.expiration_time = now_millis() + 20;
        disk.write(&stale).unwrap();
        for i in 0..7 {
            disk.write(&CacheEntry::new(format!("e{}", i), "v")).unwrap();
        }
        std::thread::sleep(Duration::from_millis(40));

        let stats = disk.run_gc().unwrap().unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.victims, 0);
        assert_eq!(stats.drained.scan, 1);
        assert_eq!(disk.len(), 7);
        assert!(!disk.contains("stale"));
    }

    fn data_file_of(dir: &TempDir, key: &str) -> std::path::PathBuf {
        let needle = format!("\"key\":\"{}\"", key);
        let mut pending = vec![dir.path().to_path_buf()];
        while let Some(path) = pending.pop() {
            for entry in std::fs::read_dir(&path).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().map(|e| e == "meta").unwrap_or(false)
                    && std::fs::read_to_string(&path).unwrap().contains(&needle)
                {
                    return path.with_extension("");
                }
            }
        }
        panic!("no record for {}", key);
    }

    #[tokio::test]
    async fn test_interrupted_drain_keeps_ids_buffered() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(&dir, DiskConfig::default());
        disk.write(&CacheEntry::new("x", "v")).unwrap();
        disk.write(&CacheEntry::new("y", "v")).unwrap();
        disk.delete("x").unwrap();
        disk.delete("y").unwrap();

        // A non-empty directory in place of the payload cannot be unlinked
        let blocked = data_file_of(&dir, "x");
        std::fs::remove_file(&blocked).unwrap();
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("pin"), b"x").unwrap();

        assert!(disk.drain(true, false).is_err());
        assert_eq!(disk.pending_invalidations().total(), 2);
        assert!(disk.read("x").unwrap().is_none());
        assert!(disk.read("y").unwrap().is_none());
        assert_eq!(disk.len(), 2);

        std::fs::remove_dir_all(&blocked).unwrap();
        let stats = disk.drain(true, false).unwrap();
        assert_eq!(stats.explicit, 2);
        assert_eq!(disk.pending_invalidations().total(), 0);
        assert!(disk.is_empty());
    }

    #[tokio::test]
    async fn test_stop_marks_clean_shutdown() {
        let dir = TempDir::new().unwrap();
        {
            let disk = open_disk(&dir, DiskConfig::default());
            disk.write_with_tags(&CacheEntry::new("kept", "v").with_dependency("d")).unwrap();
            disk.write(&CacheEntry::new("gone", "v")).unwrap();
            disk.delete("gone").unwrap();
            disk.begin_stop();
            disk.finish_stop().unwrap();
        }
        let disk = open_disk(&dir, DiskConfig::default());
        assert_eq!(disk.len(), 1);
        assert!(disk.read("kept").unwrap().is_some());
        assert!(disk.read_tag(TagKind::Dependency, "d", false).unwrap().contains("kept"));
        let props = disk.layout().read_properties().unwrap().unwrap();
        assert_eq!(props.entries, 1);
    }

    #[tokio::test]
    async fn test_unclean_shutdown_discards_records() {
        let dir = TempDir::new().unwrap();
        {
            let disk = open_disk(&dir, DiskConfig::default());
            disk.write(&CacheEntry::new("a", "v")).unwrap();
        }
        let disk = open_disk(&dir, DiskConfig::default());
        assert!(disk.is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_when_explicit_backlog_too_large() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(
            &dir,
            DiskConfig {
                explicit_buffer_limit_on_stop: 1,
                ..Default::default()
            },
        );
        for id in ["a", "b", "c"] {
            disk.write(&CacheEntry::new(id, "v")).unwrap();
        }
        disk.delete("a").unwrap();
        disk.delete("b").unwrap();
        disk.begin_stop();
        disk.finish_stop().unwrap();
        assert!(disk.is_empty());
    }
}
