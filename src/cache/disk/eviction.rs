//! Disk Eviction Heap
//!
//! Indexed binary min-heap of `(expiration, hash, size)` shadows, one per
//! live object record. Each element's slot is tracked by id so an
//! arbitrary element can be retired in O(log n) when its record is
//! rewritten or deleted.
//!
//! Records without an expiration are stored with `i64::MAX` so they sort
//! behind every expiring record.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Heap key used for records that never expire
pub const NEVER_EXPIRES: i64 = i64::MAX;

/// Policy applied once expired records do not free enough space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskEvictionPolicy {
    /// Only expired records are reclaimed
    None,
    /// Sample records uniformly
    #[default]
    Random,
    /// Reclaim the largest records first
    SizeBased,
}

impl fmt::Display for DiskEvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskEvictionPolicy::None => write!(f, "none"),
            DiskEvictionPolicy::Random => write!(f, "random"),
            DiskEvictionPolicy::SizeBased => write!(f, "size_based"),
        }
    }
}

/// Shadow of one disk record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEntry {
    pub expiration: i64,
    pub hash: u64,
    pub size: u64,
    pub id: String,
}

impl EvictionEntry {
    /// Build a shadow, mapping "no expiration" onto [`NEVER_EXPIRES`]
    pub fn new(id: impl Into<String>, expiration: i64, hash: u64, size: u64) -> Self {
        Self {
            expiration: if expiration <= 0 { NEVER_EXPIRES } else { expiration },
            hash,
            size,
            id: id.into(),
        }
    }

    fn matches(&self, expiration: i64, hash: u64, size: u64) -> bool {
        self.expiration == expiration && self.hash == hash && self.size == size
    }

    fn is_expired_at(&self, now: i64) -> bool {
        self.expiration != NEVER_EXPIRES && self.expiration <= now
    }
}

/// Indexed min-heap ordered by expiration
#[derive(Debug, Default)]
pub struct EvictionHeap {
    heap: Vec<EvictionEntry>,
    positions: HashMap<String, usize>,
    total_bytes: u64,
}

impl EvictionHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Sum of shadowed record sizes
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&EvictionEntry> {
        self.positions.get(id).map(|&slot| &self.heap[slot])
    }

    pub fn peek_min(&self) -> Option<&EvictionEntry> {
        self.heap.first()
    }

    /// Insert a shadow, replacing any existing one for the same id
    pub fn insert(&mut self, entry: EvictionEntry) {
        if self.positions.contains_key(&entry.id) {
            self.remove_id(&entry.id);
        }
        let slot = self.heap.len();
        self.total_bytes += entry.size;
        self.positions.insert(entry.id.clone(), slot);
        self.heap.push(entry);
        self.sift_up(slot);
    }

    /// Remove and return the entry with the earliest expiration
    pub fn delete_min(&mut self) -> Option<EvictionEntry> {
        self.remove_at(0)
    }

    /// Retire the shadow of `id` if it still matches the
    /// `(expiration, hash, size)` triple it was written with
    pub fn find_and_remove(&mut self, id: &str, expiration: i64, hash: u64, size: u64) -> Option<EvictionEntry> {
        let expiration = if expiration <= 0 { NEVER_EXPIRES } else { expiration };
        let slot = *self.positions.get(id)?;
        if !self.heap[slot].matches(expiration, hash, size) {
            return None;
        }
        self.remove_at(slot)
    }

    /// Retire the shadow for `id`
    pub fn remove_id(&mut self, id: &str) -> Option<EvictionEntry> {
        let slot = *self.positions.get(id)?;
        self.remove_at(slot)
    }

    /// Pop every shadow whose expiration is at or before `now`
    pub fn pop_expired(&mut self, now: i64) -> Vec<EvictionEntry> {
        let mut expired = Vec::new();
        while self.heap.first().map(|e| e.is_expired_at(now)).unwrap_or(false) {
            if let Some(entry) = self.delete_min() {
                expired.push(entry);
            }
        }
        expired
    }

    /// Select and remove victims until `entries` shadows and `bytes` bytes
    /// have been freed
    ///
    /// Expired shadows go first. The policy then picks among the rest;
    /// [`DiskEvictionPolicy::None`] stops after the expired ones.
    pub fn walk(&mut self, policy: DiskEvictionPolicy, now: i64, entries: usize, bytes: u64) -> Vec<EvictionEntry> {
        let mut victims = Vec::new();
        let mut freed_bytes = 0u64;
        let done = |victims: &Vec<EvictionEntry>, freed: u64| victims.len() >= entries && freed >= bytes;

        while !done(&victims, freed_bytes) {
            match self.heap.first() {
                Some(min) if min.is_expired_at(now) => {}
                _ => break,
            }
            if let Some(entry) = self.delete_min() {
                freed_bytes += entry.size;
                victims.push(entry);
            }
        }
        if done(&victims, freed_bytes) {
            return victims;
        }

        let mut candidates: Vec<(String, u64)> = self.heap.iter().map(|e| (e.id.clone(), e.size)).collect();
        match policy {
            DiskEvictionPolicy::None => return victims,
            DiskEvictionPolicy::Random => candidates.shuffle(&mut rand::thread_rng()),
            DiskEvictionPolicy::SizeBased => candidates.sort_by(|a, b| b.1.cmp(&a.1)),
        }
        for (id, _) in candidates {
            if done(&victims, freed_bytes) {
                break;
            }
            if let Some(entry) = self.remove_id(&id) {
                freed_bytes += entry.size;
                victims.push(entry);
            }
        }
        victims
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.positions.clear();
        self.total_bytes = 0;
    }

    fn remove_at(&mut self, slot: usize) -> Option<EvictionEntry> {
        if slot >= self.heap.len() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(slot, last);
        let entry = self.heap.pop()?;
        self.positions.remove(&entry.id);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        if slot < self.heap.len() {
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        Some(entry)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].id.clone(), a);
        self.positions.insert(self.heap[b].id.clone(), b);
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[slot].expiration >= self.heap[parent].expiration {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < len && self.heap[left].expiration < self.heap[smallest].expiration {
                smallest = left;
            }
            if right < len && self.heap[right].expiration < self.heap[smallest].expiration {
                smallest = right;
            }
            if smallest == slot {
                return;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_with(items: &[(&str, i64, u64)]) -> EvictionHeap {
        let mut heap = EvictionHeap::new();
        for (i, (id, exp, size)) in items.iter().enumerate() {
            heap.insert(EvictionEntry::new(*id, *exp, i as u64, *size));
        }
        heap
    }

    #[test]
    fn test_delete_min_orders_by_expiration() {
        let mut heap = heap_with(&[("c", 300, 1), ("a", 100, 1), ("never", -1, 1), ("b", 200, 1)]);
        let order: Vec<String> = std::iter::from_fn(|| heap.delete_min()).map(|e| e.id).collect();
        assert_eq!(order, vec!["a", "b", "c", "never"]);
        assert_eq!(heap.total_bytes(), 0);
    }

    #[test]
    fn test_find_and_remove_keeps_positions_consistent() {
        let mut heap = heap_with(&[("a", 10, 5), ("b", 20, 6), ("c", 30, 7), ("d", 40, 8), ("e", 50, 9)]);
        assert!(heap.find_and_remove("b", 25, 1, 6).is_none());
        assert!(heap.find_and_remove("c", 20, 1, 6).is_none());
        let removed = heap.find_and_remove("b", 20, 1, 6).unwrap();
        assert_eq!(removed.id, "b");
        assert!(heap.find_and_remove("b", 20, 1, 6).is_none());
        assert!(!heap.contains("b"));

        for id in ["a", "c", "d", "e"] {
            assert_eq!(heap.get(id).unwrap().id, id);
        }
        assert_eq!(heap.remove_id("d").unwrap().size, 8);
        assert_eq!(heap.delete_min().unwrap().id, "a");
        assert_eq!(heap.delete_min().unwrap().id, "c");
        assert_eq!(heap.delete_min().unwrap().id, "e");
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let mut heap = heap_with(&[("a", 10, 100)]);
        heap.insert(EvictionEntry::new("a", 50, 0, 40));
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.total_bytes(), 40);
        assert_eq!(heap.peek_min().unwrap().expiration, 50);
    }

    #[test]
    fn test_pop_expired() {
        let mut heap = heap_with(&[("a", 10, 1), ("b", 20, 1), ("c", 30, 1), ("n", 0, 1)]);
        let expired = heap.pop_expired(20);
        assert_eq!(expired.len(), 2);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn test_walk_expired_first_then_size() {
        let mut heap = heap_with(&[("old", 5, 10), ("small", -1, 10), ("big", -1, 900), ("mid", -1, 300)]);
        let victims = heap.walk(DiskEvictionPolicy::SizeBased, 100, 2, 0);
        let ids: Vec<&str> = victims.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "big"]);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn test_walk_bytes_target() {
        let mut heap = heap_with(&[("a", -1, 100), ("b", -1, 100), ("c", -1, 100), ("d", -1, 100)]);
        let victims = heap.walk(DiskEvictionPolicy::Random, 0, 0, 250);
        assert_eq!(victims.len(), 3);
        assert_eq!(heap.total_bytes(), 100);
    }

    #[test]
    fn test_walk_none_policy_only_expired() {
        let mut heap = heap_with(&[("a", 10, 1), ("b", -1, 1)]);
        let victims = heap.walk(DiskEvictionPolicy::None, 50, 2, 0);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, "a");
    }
}
