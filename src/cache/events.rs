//! Cache Events
//!
//! Change and invalidation notifications, the listener trait used for
//! synchronous delivery and the pre-invalidation veto.

use crate::error::DiskWriteStatus;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Source and Causes
// =============================================================================

/// Where an operation originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Local caller or the memory tier itself
    Memory,
    /// The disk tier
    Disk,
    /// A peer cache
    Remote,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Memory => write!(f, "memory"),
            Source::Disk => write!(f, "disk"),
            Source::Remote => write!(f, "remote"),
        }
    }
}

/// Why a change event was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeCause {
    NewEntryAdded,
    ExistingValueChanged,
    /// Cached content was revalidated; only expiration times moved
    ExpirationTimesChanged,
}

/// Why an entry was invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationCause {
    /// Caller asked for it, directly or through a tag
    Explicit,
    /// Chosen as an LRU victim with no disk to spill to
    LruEvicted,
    /// Time limit or inactivity timeout reached
    Timeout,
    /// Disk limits prevented a spill
    DiskOverflow,
    /// Reclaimed by disk garbage collection
    DiskGarbageCollected,
    /// Removed by a full clear
    ClearAll,
}

impl InvalidationCause {
    /// All causes, for per-cause counters
    pub const ALL: [InvalidationCause; 6] = [
        InvalidationCause::Explicit,
        InvalidationCause::LruEvicted,
        InvalidationCause::Timeout,
        InvalidationCause::DiskOverflow,
        InvalidationCause::DiskGarbageCollected,
        InvalidationCause::ClearAll,
    ];

    /// Dense index for counter arrays
    pub fn index(&self) -> usize {
        match self {
            InvalidationCause::Explicit => 0,
            InvalidationCause::LruEvicted => 1,
            InvalidationCause::Timeout => 2,
            InvalidationCause::DiskOverflow => 3,
            InvalidationCause::DiskGarbageCollected => 4,
            InvalidationCause::ClearAll => 5,
        }
    }
}

impl fmt::Display for InvalidationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationCause::Explicit => write!(f, "explicit"),
            InvalidationCause::LruEvicted => write!(f, "lru"),
            InvalidationCause::Timeout => write!(f, "timeout"),
            InvalidationCause::DiskOverflow => write!(f, "disk-overflow"),
            InvalidationCause::DiskGarbageCollected => write!(f, "disk-gc"),
            InvalidationCause::ClearAll => write!(f, "clear-all"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Entry was added or replaced
    Changed {
        id: String,
        cause: ChangeCause,
        source: Source,
    },

    /// Entry was invalidated
    Invalidated {
        id: String,
        cause: InvalidationCause,
        source: Source,
        #[serde(skip)]
        value: Option<Bytes>,
    },

    /// Entry moved from memory to disk
    Spilled {
        id: String,
        size_bytes: u64,
        overwritten: bool,
    },

    /// Entry loaded into memory from another tier
    Promoted {
        id: String,
        from: Source,
    },

    /// A write to the disk tier was rejected
    DiskWriteFailed {
        id: String,
        status: DiskWriteStatus,
    },

    /// The disk tier was turned off for this instance
    DiskDisabled {
        reason: String,
    },

    /// A cleanup pass drained the invalidation buffer
    CleanupCompleted {
        explicit: u64,
        scan: u64,
        garbage_collected: u64,
        expired_found: u64,
    },

    /// Garbage collection trimmed the disk tier
    GarbageCollected {
        entries_removed: u64,
        bytes_freed: u64,
    },

    /// Every entry was removed
    Cleared {
        memory_entries: u64,
        disk_entries: u64,
    },
}

impl CacheEvent {
    /// Create a Changed event
    pub fn changed(id: &str, cause: ChangeCause, source: Source) -> Self {
        CacheEvent::Changed {
            id: id.to_string(),
            cause,
            source,
        }
    }

    /// Create an Invalidated event
    pub fn invalidated(id: &str, cause: InvalidationCause, source: Source, value: Option<Bytes>) -> Self {
        CacheEvent::Invalidated {
            id: id.to_string(),
            cause,
            source,
            value,
        }
    }

    /// Get the cache id associated with this event (if any)
    pub fn id(&self) -> Option<&str> {
        match self {
            CacheEvent::Changed { id, .. } => Some(id),
            CacheEvent::Invalidated { id, .. } => Some(id),
            CacheEvent::Spilled { id, .. } => Some(id),
            CacheEvent::Promoted { id, .. } => Some(id),
            CacheEvent::DiskWriteFailed { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::DiskWriteFailed { .. } | CacheEvent::DiskDisabled { .. }
        )
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Synchronous event sink
///
/// `on_change` and `on_invalidate` run after the coordinator lock has been
/// released. `should_invalidate` runs while it is held and must not call
/// back into the cache.
pub trait CacheListener: Send + Sync {
    /// Entry added or replaced
    fn on_change(&self, _event: &CacheEvent) {}

    /// Entry invalidated
    fn on_invalidate(&self, _event: &CacheEvent) {}

    /// Veto an LRU invalidation; return false to keep the entry
    fn should_invalidate(&self, _id: &str, _source: Source, _cause: InvalidationCause) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let changed = CacheEvent::changed("a", ChangeCause::NewEntryAdded, Source::Memory);
        assert_eq!(changed.id(), Some("a"));
        assert!(!changed.is_error());

        let failed = CacheEvent::DiskWriteFailed {
            id: "b".into(),
            status: DiskWriteStatus::DiskSizeOverLimit,
        };
        assert!(failed.is_error());

        let cleared = CacheEvent::Cleared {
            memory_entries: 1,
            disk_entries: 2,
        };
        assert_eq!(cleared.id(), None);
    }

    #[test]
    fn test_cause_indexes_are_dense() {
        for (i, cause) in InvalidationCause::ALL.iter().enumerate() {
            assert_eq!(cause.index(), i);
        }
        assert_eq!(format!("{}", InvalidationCause::LruEvicted), "lru");
    }

    #[test]
    fn test_event_serializes_without_value() {
        let event = CacheEvent::invalidated(
            "x",
            InvalidationCause::Timeout,
            Source::Disk,
            Some(Bytes::from_static(b"v")),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Timeout"));
        assert!(!json.contains("value"));
    }
}
