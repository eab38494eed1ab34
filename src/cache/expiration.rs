//! Expiration Schedule
//!
//! Min-heap of `(deadline, id)` pairs driving the memory sweep. Rewrites
//! leave superseded pairs in the heap; `scheduled` holds the live deadline
//! per id, so stale pairs are skipped on pop and the heap is rebuilt once
//! they outnumber the live ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Stale pairs tolerated before a rebuild, on top of twice the live count
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Default)]
pub struct ExpirationSchedule {
    heap: BinaryHeap<Reverse<(i64, String)>>,
    scheduled: HashMap<String, i64>,
}

impl ExpirationSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` at `deadline`, replacing any earlier deadline. A
    /// non-positive deadline unschedules.
    pub fn schedule(&mut self, id: &str, deadline: i64) {
        if deadline <= 0 {
            self.unschedule(id);
            return;
        }
        if self.scheduled.get(id) == Some(&deadline) {
            return;
        }
        self.scheduled.insert(id.to_string(), deadline);
        self.heap.push(Reverse((deadline, id.to_string())));
        self.compact_if_needed();
    }

    pub fn unschedule(&mut self, id: &str) -> bool {
        let removed = self.scheduled.remove(id).is_some();
        if removed {
            self.compact_if_needed();
        }
        removed
    }

    /// Remove and return every id whose live deadline is at or before `now`
    pub fn pop_due(&mut self, now: i64) -> Vec<String> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, id))) = self.heap.pop() else {
                break;
            };
            if self.scheduled.get(&id) == Some(&deadline) {
                self.scheduled.remove(&id);
                due.push(id);
            }
        }
        due
    }

    pub fn deadline(&self, id: &str) -> Option<i64> {
        self.scheduled.get(id).copied()
    }

    /// Ids currently scheduled
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Pairs held by the heap, stale ones included
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.scheduled.clear();
    }

    fn compact_if_needed(&mut self) {
        if self.heap.len() <= 2 * self.scheduled.len() + COMPACT_SLACK {
            return;
        }
        self.heap = self
            .scheduled
            .iter()
            .map(|(id, deadline)| Reverse((*deadline, id.clone())))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut schedule = ExpirationSchedule::new();
        schedule.schedule("late", 300);
        schedule.schedule("early", 100);
        schedule.schedule("never", 0);

        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule.pop_due(50), Vec::<String>::new());
        assert_eq!(schedule.pop_due(300), vec!["early".to_string(), "late".to_string()]);
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_rescheduled_id_fires_once_at_new_deadline() {
        let mut schedule = ExpirationSchedule::new();
        schedule.schedule("a", 100);
        schedule.schedule("a", 200);
        assert!(schedule.pop_due(150).is_empty());
        assert_eq!(schedule.pop_due(200), vec!["a".to_string()]);
        assert!(schedule.pop_due(1000).is_empty());
    }

    #[test]
    fn test_unscheduled_id_never_fires() {
        let mut schedule = ExpirationSchedule::new();
        schedule.schedule("a", 100);
        assert!(schedule.unschedule("a"));
        assert!(!schedule.unschedule("a"));
        assert!(schedule.pop_due(1000).is_empty());
    }

    #[test]
    fn test_rewrites_keep_heap_bounded() {
        let mut schedule = ExpirationSchedule::new();
        for i in 0..10_000 {
            schedule.schedule("hot", 1_000 + i);
        }
        assert_eq!(schedule.len(), 1);
        assert!(schedule.heap_len() <= 2 + COMPACT_SLACK + 1);
        assert_eq!(schedule.deadline("hot"), Some(10_999));
    }
}
