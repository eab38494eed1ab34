//! Priority Clock
//!
//! Clock-style LRU over priority buckets. An entry with priority `p` lives in
//! bucket `(top + p) mod P`; victims are taken from the front of the bucket at
//! `top`. When that bucket holds nothing evictable it is merged into the next
//! one and `top` advances, which ages every entry by one priority level.
//!
//! ```text
//!          top
//!           │
//!           ▼
//!   ┌────┬────┬────┬────┬────┐
//!   │ b0 │ b1 │ b2 │ b3 │ b4 │   P = max_priority + 1 buckets
//!   └────┴────┴────┴────┴────┘
//!      ▲     └─▶ victims come from the front of bucket[top]
//!      └── priority 4 entries land at (top + 4) mod P
//! ```
//!
//! Recency is approximate: entries already in their target bucket are not
//! moved on access.

use crate::cache::entry::{CacheEntry, EntryState};
use crate::cache::pool::{EntryHandle, EntryPool};
use indexmap::IndexSet;

/// Array of FIFO buckets with a rotating top pointer
#[derive(Debug)]
pub struct PriorityClock {
    buckets: Vec<IndexSet<EntryHandle>>,
    top: usize,
    bucket_scans: u64,
}

impl PriorityClock {
    /// Create a clock with `max_priority + 1` buckets
    pub fn new(max_priority: u8) -> Self {
        let count = usize::from(max_priority) + 1;
        Self {
            buckets: (0..count).map(|_| IndexSet::new()).collect(),
            top: 0,
            bucket_scans: 0,
        }
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Physical index of the current top bucket
    pub fn top(&self) -> usize {
        self.top
    }

    /// Number of entries in a physical bucket
    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map(|b| b.len()).unwrap_or(0)
    }

    /// Total entries tracked
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Whether no entries are tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Total bucket examinations made by [`select_victim`](Self::select_victim)
    pub fn bucket_scans(&self) -> u64 {
        self.bucket_scans
    }

    /// Physical bucket for a priority under the current rotation
    pub fn target_bucket(&self, priority: u8) -> usize {
        let len = self.buckets.len();
        let priority = usize::from(priority).min(len - 1);
        (self.top + priority) % len
    }

    /// Place an entry in the bucket matching its priority
    ///
    /// An entry already in its target bucket keeps its position. Returns
    /// true if the entry was moved.
    pub fn update_location(&mut self, handle: EntryHandle, entry: &mut CacheEntry) -> bool {
        let target = self.target_bucket(entry.priority);
        if entry.lru_bucket == Some(target) {
            return false;
        }
        if let Some(current) = entry.lru_bucket {
            if let Some(bucket) = self.buckets.get_mut(current) {
                bucket.shift_remove(&handle);
            }
        }
        self.buckets[target].insert(handle);
        entry.lru_bucket = Some(target);
        true
    }

    /// Place an entry at the back of its target bucket, even if already
    /// there
    pub fn refresh(&mut self, handle: EntryHandle, entry: &mut CacheEntry) {
        self.remove(handle, entry);
        self.update_location(handle, entry);
    }

    /// Detach an entry from its bucket
    pub fn remove(&mut self, handle: EntryHandle, entry: &mut CacheEntry) -> bool {
        let Some(current) = entry.lru_bucket.take() else {
            return false;
        };
        self.buckets
            .get_mut(current)
            .map(|bucket| bucket.shift_remove(&handle))
            .unwrap_or(false)
    }

    /// Move an entry to the back of the farthest bucket so it is not
    /// considered again until a full rotation has passed
    pub fn requeue(&mut self, handle: EntryHandle, entry: &mut CacheEntry) {
        self.remove(handle, entry);
        let target = self.target_bucket(u8::MAX);
        self.buckets[target].insert(handle);
        entry.lru_bucket = Some(target);
    }

    /// Pick the next entry to evict
    ///
    /// Scans the top bucket for the first unpinned live entry. If there is
    /// none, the top bucket is merged in front of the next bucket and `top`
    /// advances. At most one full rotation is made; `None` means every
    /// tracked entry is pinned and the caller must fall back to an overflow
    /// allocation. The victim is not detached.
    pub fn select_victim(&mut self, pool: &mut EntryPool) -> Option<EntryHandle> {
        let len = self.buckets.len();
        for _ in 0..len {
            self.bucket_scans += 1;
            let top = self.top;
            let found = self.buckets[top].iter().copied().find(|handle| {
                pool.get(*handle)
                    .map(|e| e.ref_count == 0 && e.state == EntryState::Live)
                    .unwrap_or(false)
            });
            if found.is_some() {
                return found;
            }
            if len == 1 {
                return None;
            }

            let next = (top + 1) % len;
            let aged = std::mem::take(&mut self.buckets[top]);
            if !aged.is_empty() {
                for handle in &aged {
                    if let Some(entry) = pool.get_mut(*handle) {
                        entry.lru_bucket = Some(next);
                    }
                }
                let newer = std::mem::take(&mut self.buckets[next]);
                let mut merged = aged;
                merged.extend(newer);
                self.buckets[next] = merged;
            }
            self.top = next;
        }
        None
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.top = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(pool: &mut EntryPool, clock: &mut PriorityClock, id: &str, priority: u8) -> EntryHandle {
        let handle = pool.allocate();
        let entry = pool.get_mut(handle).unwrap();
        entry.id = id.to_string();
        entry.priority = priority;
        clock.update_location(handle, entry);
        handle
    }

    #[test]
    fn test_placement_by_priority() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(4);
        assert_eq!(clock.bucket_count(), 5);

        insert(&mut pool, &mut clock, "low", 0);
        insert(&mut pool, &mut clock, "high", 4);
        assert_eq!(clock.bucket_len(0), 1);
        assert_eq!(clock.bucket_len(4), 1);
        assert_eq!(clock.len(), 2);
    }

    #[test]
    fn test_priority_clamped_to_last_bucket() {
        let clock = PriorityClock::new(2);
        assert_eq!(clock.target_bucket(200), 2);
    }

    #[test]
    fn test_victim_is_oldest_lowest_priority() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(4);
        let first = insert(&mut pool, &mut clock, "first", 0);
        insert(&mut pool, &mut clock, "second", 0);
        insert(&mut pool, &mut clock, "important", 3);

        assert_eq!(clock.select_victim(&mut pool), Some(first));
    }

    #[test]
    fn test_refresh_moves_to_back_of_bucket() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(2);
        let first = insert(&mut pool, &mut clock, "first", 0);
        let second = insert(&mut pool, &mut clock, "second", 0);

        clock.refresh(first, pool.get_mut(first).unwrap());
        assert_eq!(clock.bucket_len(0), 2);
        assert_eq!(clock.select_victim(&mut pool), Some(second));
    }

    #[test]
    fn test_skips_pinned() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(2);
        let pinned = insert(&mut pool, &mut clock, "pinned", 0);
        let free = insert(&mut pool, &mut clock, "free", 0);
        pool.get_mut(pinned).unwrap().ref_count = 1;

        assert_eq!(clock.select_victim(&mut pool), Some(free));
    }

    #[test]
    fn test_aging_merges_and_advances_top() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(3);
        let pinned = insert(&mut pool, &mut clock, "pinned", 0);
        let later = insert(&mut pool, &mut clock, "later", 2);
        pool.get_mut(pinned).unwrap().ref_count = 1;

        let victim = clock.select_victim(&mut pool);
        assert_eq!(victim, Some(later));
        assert_eq!(clock.top(), 2);
        // the pinned entry was carried forward ahead of the newer one
        assert_eq!(pool.get(pinned).unwrap().lru_bucket, Some(2));
        assert_eq!(clock.bucket_len(2), 2);
    }

    #[test]
    fn test_all_pinned_returns_none() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(3);
        for i in 0..10 {
            let h = insert(&mut pool, &mut clock, &format!("e{i}"), (i % 4) as u8);
            pool.get_mut(h).unwrap().ref_count = 1;
        }
        assert_eq!(clock.select_victim(&mut pool), None);
        assert_eq!(clock.len(), 10);
        assert!(clock.bucket_scans() <= 4);
    }

    #[test]
    fn test_bounded_scans_when_unpinned() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(8);
        for i in 0..1000 {
            insert(&mut pool, &mut clock, &format!("e{i}"), 8);
        }
        assert!(clock.select_victim(&mut pool).is_some());
        assert!(clock.bucket_scans() <= clock.bucket_count() as u64);
    }

    #[test]
    fn test_requeue_defers_victim() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(4);
        let kept = insert(&mut pool, &mut clock, "kept", 0);
        let next = insert(&mut pool, &mut clock, "next", 1);

        assert_eq!(clock.select_victim(&mut pool), Some(kept));
        clock.requeue(kept, pool.get_mut(kept).unwrap());
        assert_eq!(pool.get(kept).unwrap().lru_bucket, Some(4));
        assert_eq!(clock.select_victim(&mut pool), Some(next));
        assert_eq!(clock.len(), 2);
    }

    #[test]
    fn test_update_location_moves_only_when_misplaced() {
        let mut pool = EntryPool::new();
        let mut clock = PriorityClock::new(4);
        let h = insert(&mut pool, &mut clock, "a", 1);
        let entry = pool.get_mut(h).unwrap();
        assert!(!clock.update_location(h, entry));

        entry.priority = 3;
        assert!(clock.update_location(h, entry));
        assert_eq!(clock.bucket_len(1), 0);
        assert_eq!(clock.bucket_len(3), 1);

        assert!(clock.remove(h, entry));
        assert!(clock.is_empty());
        assert!(!clock.remove(h, entry));
    }
}
