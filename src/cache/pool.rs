//! Entry Pool
//!
//! Arena of reusable entry slots addressed by generation-checked handles.
//! Releasing a handle resets the slot and puts it on a free list; a stale
//! handle (released, then reused) never resolves to the new occupant.

use crate::cache::entry::CacheEntry;

// =============================================================================
// Entry Handle
// =============================================================================

/// Stable reference to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: u32,
    generation: u32,
}

impl EntryHandle {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

// =============================================================================
// Entry Pool
// =============================================================================

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupied: bool,
    entry: CacheEntry,
}

/// Reusable allocation arena for cache entries
#[derive(Debug, Default)]
pub struct EntryPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    in_use: usize,
    overflow_allocations: u64,
}

impl EntryPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with `capacity` pre-allocated free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            ..Default::default()
        };
        for index in (0..capacity as u32).rev() {
            pool.slots.push(Slot::default());
            pool.free.push(index);
        }
        pool
    }

    /// Take a cleared slot, preferring a freed one over growing the arena
    pub fn allocate(&mut self) -> EntryHandle {
        self.in_use += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.occupied = true;
            return EntryHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            occupied: true,
            entry: CacheEntry::default(),
        });
        EntryHandle { index, generation: 0 }
    }

    /// Allocate past the configured entry limit because every candidate
    /// victim is pinned
    pub fn allocate_overflow(&mut self) -> EntryHandle {
        self.overflow_allocations += 1;
        self.allocate()
    }

    /// Reset a slot and return it to the free list
    ///
    /// Returns false for a stale or already released handle, so a slot is
    /// released exactly once.
    pub fn release(&mut self, handle: EntryHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            return false;
        };
        if !slot.occupied || slot.generation != handle.generation {
            return false;
        }
        slot.entry.reset();
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.in_use -= 1;
        true
    }

    /// Resolve a handle
    pub fn get(&self, handle: EntryHandle) -> Option<&CacheEntry> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &slot.entry)
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut CacheEntry> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &mut slot.entry)
    }

    /// Check that a handle still refers to its slot
    pub fn is_valid(&self, handle: EntryHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of occupied slots
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of free slots ready for reuse
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Number of allocations made past the entry limit
    pub fn overflow_allocations(&self) -> u64 {
        self.overflow_allocations
    }

    /// Release every occupied slot
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.occupied {
                slot.entry.reset();
                slot.occupied = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.in_use = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let mut pool = EntryPool::new();
        let h = pool.allocate();
        pool.get_mut(h).unwrap().id = "a".into();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.get(h).unwrap().id, "a");

        assert!(pool.release(h));
        assert!(!pool.release(h));
        assert!(pool.get(h).is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_reuses_freed_slot_with_new_generation() {
        let mut pool = EntryPool::new();
        let first = pool.allocate();
        pool.release(first);

        let second = pool.allocate();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert!(pool.get(second).unwrap().id.is_empty());
    }

    #[test]
    fn test_preallocated_capacity() {
        let mut pool = EntryPool::with_capacity(4);
        assert_eq!(pool.free_slots(), 4);
        let h = pool.allocate();
        assert_eq!(h.index(), 0);
        assert_eq!(pool.free_slots(), 3);
    }

    #[test]
    fn test_overflow_counts() {
        let mut pool = EntryPool::new();
        let h = pool.allocate_overflow();
        assert!(pool.is_valid(h));
        assert_eq!(pool.overflow_allocations(), 1);
    }

    #[test]
    fn test_clear() {
        let mut pool = EntryPool::new();
        let a = pool.allocate();
        let b = pool.allocate();
        pool.clear();
        assert!(!pool.is_valid(a));
        assert!(!pool.is_valid(b));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_slots(), 2);
    }
}
