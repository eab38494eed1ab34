//! Invalidation Buffer
//!
//! Deferred-delete queues for the disk tier. An id in any queue is already
//! gone as far as readers are concerned; the physical record is removed
//! later by a drain.
//!
//! ```text
//!   explicit ──┐
//!   scan     ──┼──▶ pop_next_batch ──▶ physical delete (object + aliases + tags)
//!   gc       ──┘
//! ```

use indexmap::IndexSet;
use serde::Serialize;
use std::fmt;

/// Which queue an id was deferred into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Caller invalidations and overwritten copies
    Explicit,
    /// Expired records found by the cleanup scan
    Scan,
    /// Victims chosen by garbage collection
    GarbageCollector,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Explicit => write!(f, "explicit"),
            BufferKind::Scan => write!(f, "scan"),
            BufferKind::GarbageCollector => write!(f, "gc"),
        }
    }
}

/// Pending ids per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounts {
    pub explicit: usize,
    pub scan: usize,
    pub garbage_collector: usize,
}

impl BufferCounts {
    pub fn total(&self) -> usize {
        self.explicit + self.scan + self.garbage_collector
    }
}

/// Three bounded deferred-delete queues
#[derive(Debug)]
pub struct InvalidationBuffer {
    explicit: IndexSet<String>,
    scan: IndexSet<String>,
    garbage_collector: IndexSet<String>,
    capacity: usize,
}

impl InvalidationBuffer {
    /// Create a buffer that reports full at `capacity` pending ids
    pub fn new(capacity: usize) -> Self {
        Self {
            explicit: IndexSet::new(),
            scan: IndexSet::new(),
            garbage_collector: IndexSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn queue_mut(&mut self, kind: BufferKind) -> &mut IndexSet<String> {
        match kind {
            BufferKind::Explicit => &mut self.explicit,
            BufferKind::Scan => &mut self.scan,
            BufferKind::GarbageCollector => &mut self.garbage_collector,
        }
    }

    /// Defer an id; returns false if it was already pending in any queue
    pub fn add(&mut self, id: &str, kind: BufferKind) -> bool {
        if self.contains(id) {
            return false;
        }
        self.queue_mut(kind).insert(id.to_string())
    }

    /// Defer several ids, returning how many were newly added
    pub fn add_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>, kind: BufferKind) -> usize {
        ids.into_iter().filter(|id| self.add(id, kind)).count()
    }

    /// Whether a disk read of `id` must be treated as a miss
    pub fn contains(&self, id: &str) -> bool {
        self.explicit.contains(id) || self.scan.contains(id) || self.garbage_collector.contains(id)
    }

    /// Withdraw a pending delete, used when the id is written again
    pub fn remove(&mut self, id: &str) -> bool {
        let a = self.explicit.shift_remove(id);
        let b = self.scan.shift_remove(id);
        let c = self.garbage_collector.shift_remove(id);
        a || b || c
    }

    pub fn len(&self) -> usize {
        self.explicit.len() + self.scan.len() + self.garbage_collector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writers must force a drain once this is true
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counts(&self) -> BufferCounts {
        BufferCounts {
            explicit: self.explicit.len(),
            scan: self.scan.len(),
            garbage_collector: self.garbage_collector.len(),
        }
    }

    /// Take up to `max` ids from one queue, oldest first
    pub fn pop_batch(&mut self, kind: BufferKind, max: usize) -> Vec<String> {
        let queue = self.queue_mut(kind);
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Take the next batch in drain order
    ///
    /// Explicit ids go first when `prefer_explicit` is set, otherwise the
    /// scan and gc queues are served ahead of them.
    pub fn pop_next_batch(&mut self, prefer_explicit: bool, max: usize) -> Option<(BufferKind, Vec<String>)> {
        let order = if prefer_explicit {
            [BufferKind::Explicit, BufferKind::Scan, BufferKind::GarbageCollector]
        } else {
            [BufferKind::Scan, BufferKind::GarbageCollector, BufferKind::Explicit]
        };
        for kind in order {
            let batch = self.pop_batch(kind, max);
            if !batch.is_empty() {
                return Some((kind, batch));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.explicit.clear();
        self.scan.clear();
        self.garbage_collector.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_across_queues() {
        let mut buffer = InvalidationBuffer::new(10);
        assert!(buffer.add("a", BufferKind::Explicit));
        assert!(buffer.add("b", BufferKind::Scan));
        assert!(buffer.add("c", BufferKind::GarbageCollector));
        assert!(!buffer.add("a", BufferKind::Scan));

        assert!(buffer.contains("a") && buffer.contains("b") && buffer.contains("c"));
        assert_eq!(buffer.counts().total(), 3);

        assert!(buffer.remove("b"));
        assert!(!buffer.contains("b"));
    }

    #[test]
    fn test_full_at_capacity() {
        let mut buffer = InvalidationBuffer::new(2);
        buffer.add("a", BufferKind::Explicit);
        assert!(!buffer.is_full());
        buffer.add("b", BufferKind::GarbageCollector);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_drain_order() {
        let mut buffer = InvalidationBuffer::new(100);
        let ids: Vec<String> = (0..5).map(|i| format!("e{}", i)).collect();
        buffer.add_all(ids.iter(), BufferKind::Explicit);
        buffer.add("s0", BufferKind::Scan);

        let (kind, batch) = buffer.pop_next_batch(true, 3).unwrap();
        assert_eq!(kind, BufferKind::Explicit);
        assert_eq!(batch, vec!["e0", "e1", "e2"]);

        let (kind, batch) = buffer.pop_next_batch(false, 3).unwrap();
        assert_eq!(kind, BufferKind::Scan);
        assert_eq!(batch, vec!["s0"]);

        let (_, batch) = buffer.pop_next_batch(false, 3).unwrap();
        assert_eq!(batch, vec!["e3", "e4"]);
        assert!(buffer.pop_next_batch(true, 3).is_none());
    }
}
