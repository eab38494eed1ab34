//! Cache Lifecycle
//!
//! `start` arms the background passes. `stop` cancels them, waits a bounded
//! time for in-flight disk passes, optionally flushes memory to disk and
//! leaves the disk layout marked as cleanly shut down.

use crate::cache::manager::TieredCache;
use crate::error::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_POLL: Duration = Duration::from_millis(10);

impl TieredCache {
    /// Arm periodic disk cleanup and the memory expiration sweep
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) || self.is_stopped() {
            return;
        }
        if let Some(disk) = self.disk() {
            disk.schedule_cleanup();
        }
        self.schedule_expiration_sweep();
        info!(cache = %self.config.name, "cache started");
    }

    fn schedule_expiration_sweep(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let interval = Duration::from_secs(self.config.expiration_sweep_interval_secs.max(1));
        let cache = Arc::downgrade(self);
        self.scheduler.schedule_once(
            interval,
            Box::new(move || {
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                cache.sweep_expired();
                cache.schedule_expiration_sweep();
            }),
        );
    }

    /// Shut the cache down
    ///
    /// The disk tier is detached afterwards even if its shutdown failed;
    /// the error is still returned.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scheduler.cancel_all();

        let disk = self.disk.read().clone();
        let result = match disk {
            Some(disk) => {
                disk.begin_stop();
                let wait = Duration::from_secs(self.config.disk.shutdown_wait_secs);
                let settled = tokio::time::timeout(wait, async {
                    while disk.is_busy() {
                        tokio::time::sleep(BUSY_POLL).await;
                    }
                })
                .await
                .is_ok();
                if !settled {
                    warn!(cache = %self.config.name, wait_secs = wait.as_secs(), "disk pass still running at stop");
                }

                let flush = self.config.disk.flush_to_disk_on_stop
                    && self.swap_to_disk.load(Ordering::Acquire)
                    && disk.is_enabled();
                let cache = Arc::clone(self);
                tokio::task::spawn_blocking(move || -> Result<usize> {
                    let flushed = if flush { cache.flush_memory_to_disk(&disk) } else { 0 };
                    disk.finish_stop()?;
                    Ok(flushed)
                })
                .await
                .map_err(|e| Error::Internal(format!("disk shutdown task failed: {}", e)))
                .and_then(|r| r)
            }
            None => Ok(0),
        };

        *self.disk.write() = None;
        self.swap_to_disk.store(false, Ordering::Release);

        match result {
            Ok(flushed) => {
                info!(cache = %self.config.name, flushed, "cache stopped");
                Ok(())
            }
            Err(e) => {
                warn!(cache = %self.config.name, error = %e, "cache stopped with disk errors");
                Err(e)
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queue a disk cleanup pass now; false if one is running or there is
    /// no disk tier
    pub fn invoke_cleanup(&self) -> bool {
        self.disk().map(|d| d.invoke_cleanup()).unwrap_or(false)
    }

    /// Queue disk garbage collection if a watermark is exceeded
    pub fn invoke_gc(&self) -> bool {
        self.disk().map(|d| d.invoke_gc_if_necessary()).unwrap_or(false)
    }

    /// Allow or forbid spilling evicted entries to disk
    pub fn set_swap_to_disk(&self, enabled: bool) -> bool {
        let enabled = enabled && self.disk().is_some();
        self.swap_to_disk.store(enabled, Ordering::Release);
        debug!(cache = %self.config.name, enabled, "swap to disk updated");
        enabled
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::entry::{now_millis, CacheEntry};
    use crate::cache::manager::TieredCache;
    use crate::config::{CacheConfig, DiskConfig};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, flush: bool) -> CacheConfig {
        CacheConfig {
            cache_size_limit: 10,
            expiration_sweep_interval_secs: 1,
            disk: DiskConfig {
                enabled: true,
                location: dir.path().to_path_buf(),
                flush_to_disk_on_stop: flush,
                ..Default::default()
            },
            ..CacheConfig::named("lifecycle")
        }
    }

    async fn test_cache(flush: bool) -> (Arc<TieredCache>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = TieredCache::new(config(&dir, flush)).unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn test_stop_flushes_memory_to_disk() {
        let (cache, dir) = test_cache(true).await;
        cache.start();
        cache.put(CacheEntry::new("a", "v1").with_dependency("d")).unwrap();
        cache.put(CacheEntry::new("b", "v2")).unwrap();
        cache.put(CacheEntry::new("local", "v3").memory_only()).unwrap();
        cache.stop().await.unwrap();
        assert!(cache.is_stopped());

        let reopened = TieredCache::new(config(&dir, true)).unwrap();
        assert_eq!(reopened.disk_len(), 2);
        assert_eq!(reopened.get("a").unwrap().value.as_deref(), Some(&b"v1"[..]));
        assert!(reopened.get("local").is_none());
        assert!(reopened.get_ids_by_dependency("d").contains("a"));
    }

    #[tokio::test]
    async fn test_stop_without_flush_keeps_spilled_entries_only() {
        let (cache, dir) = test_cache(false).await;
        for i in 0..11 {
            cache.put(CacheEntry::new(format!("e{}", i), "v")).unwrap();
        }
        cache.stop().await.unwrap();

        let reopened = TieredCache::new(config(&dir, false)).unwrap();
        assert_eq!(reopened.disk_len(), 1);
        assert!(reopened.get("e0").is_some());
    }

    #[tokio::test]
    async fn test_stop_detaches_disk() {
        let (cache, _dir) = test_cache(false).await;
        cache.stop().await.unwrap();
        cache.stop().await.unwrap();

        assert_eq!(cache.disk_len(), 0);
        assert!(!cache.invoke_cleanup());
        assert_matches!(
            cache.put(CacheEntry::new("d", "v").direct_to_disk()),
            Err(Error::DiskUnavailable)
        );
    }

    #[tokio::test]
    async fn test_background_sweep_expires_entries() {
        let (cache, _dir) = test_cache(false).await;
        let mut entry = CacheEntry::new("short", "v");
        entry.expiration_time = now_millis() + 50;
        cache.put(entry).unwrap();
        cache.start();
        assert!(cache.is_started());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(cache.is_empty());
        cache.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_swap_to_disk_toggle() {
        let (cache, _dir) = test_cache(false).await;
        assert!(!cache.set_swap_to_disk(false));
        for i in 0..11 {
            cache.put(CacheEntry::new(format!("e{}", i), "v")).unwrap();
        }
        assert_eq!(cache.disk_len(), 0);
        assert!(cache.get("e0").is_none());

        assert!(cache.set_swap_to_disk(true));
        cache.put(CacheEntry::new("e11", "v")).unwrap();
        assert_eq!(cache.disk_len(), 1);
    }
}
