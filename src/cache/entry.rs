//! Cache Entry Types
//!
//! The unit of storage: identity, aliases, value, tags, TTL seeds and the
//! lifecycle state used by the pinning protocol.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Expiration value meaning "never expires"
pub const NO_EXPIRATION: i64 = -1;

/// Current wall-clock time in Unix milliseconds
#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stable-within-process hash of a cache id
pub fn id_hash(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// Sharing Policy
// =============================================================================

/// How an entry is shared with peer caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    #[default]
    NotShared,
    SharedPush,
    SharedPull,
    SharedPushPull,
}

impl SharingPolicy {
    /// Whether writes are pushed to peers
    pub fn pushes(&self) -> bool {
        matches!(self, SharingPolicy::SharedPush | SharingPolicy::SharedPushPull)
    }

    /// Whether misses may be pulled from peers
    pub fn pulls(&self) -> bool {
        matches!(self, SharingPolicy::SharedPull | SharingPolicy::SharedPushPull)
    }
}

// =============================================================================
// Entry State
// =============================================================================

/// Removal state machine of an in-memory entry
///
/// ```text
/// Live ──remove──▶ MarkedForRemoval ──refCount == 0──▶ (freed to pool)
///                          │
///                          └──refCount > 0──▶ PinnedPendingRelease ──last unpin──▶ (freed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    #[default]
    Live,
    MarkedForRemoval,
    PinnedPendingRelease,
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A cached entry with metadata
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// Canonical cache id
    pub id: String,
    /// Secondary ids resolving to this entry
    pub aliases: Vec<String>,
    /// In-memory value
    pub value: Option<Bytes>,
    /// Encoded form of the value, produced lazily for disk writes
    pub serialized_value: Option<Bytes>,
    /// Dependency ids this entry is grouped under
    pub dependency_ids: Vec<String>,
    /// Templates this entry is grouped under
    pub templates: Vec<String>,
    /// Eviction priority (higher survives longer)
    pub priority: u8,
    /// Time limit in seconds (<= 0 means none)
    pub time_limit: i32,
    /// Inactivity timeout in seconds (<= 0 means none)
    pub inactivity: i32,
    /// Absolute expiration in Unix millis, [`NO_EXPIRATION`] when unset
    pub expiration_time: i64,
    /// Absolute validator expiration in Unix millis, [`NO_EXPIRATION`] when unset
    pub validator_expiration_time: i64,
    /// Creation time in Unix millis
    pub created_at: i64,
    /// Peer sharing policy
    pub sharing_policy: SharingPolicy,
    /// Whether the entry may spill to disk
    pub persist_to_disk: bool,
    /// Bypass memory and write straight to disk
    pub skip_memory_and_write_to_disk: bool,

    pub(crate) state: EntryState,
    pub(crate) loaded_from_disk: bool,
    pub(crate) ref_count: u32,
    pub(crate) lru_bucket: Option<usize>,
}

impl CacheEntry {
    /// Create a new entry with a value and no expiration
    pub fn new(id: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            value: Some(value.into()),
            priority: 1,
            expiration_time: NO_EXPIRATION,
            validator_expiration_time: NO_EXPIRATION,
            persist_to_disk: true,
            ..Default::default()
        }
    }

    /// Add a dependency id
    pub fn with_dependency(mut self, dependency_id: impl Into<String>) -> Self {
        self.dependency_ids.push(dependency_id.into());
        self
    }

    /// Add a template
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.templates.push(template.into());
        self
    }

    /// Add an alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time limit in seconds
    pub fn with_time_limit(mut self, seconds: i32) -> Self {
        self.time_limit = seconds;
        self
    }

    /// Set the inactivity timeout in seconds
    pub fn with_inactivity(mut self, seconds: i32) -> Self {
        self.inactivity = seconds;
        self
    }

    /// Set the sharing policy
    pub fn with_sharing_policy(mut self, policy: SharingPolicy) -> Self {
        self.sharing_policy = policy;
        self
    }

    /// Route this entry straight to the disk tier
    pub fn direct_to_disk(mut self) -> Self {
        self.skip_memory_and_write_to_disk = true;
        self
    }

    /// Keep this entry out of the disk tier
    pub fn memory_only(mut self) -> Self {
        self.persist_to_disk = false;
        self
    }

    /// Current pin count
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Current removal state
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Whether this copy was promoted from the disk tier
    pub fn loaded_from_disk(&self) -> bool {
        self.loaded_from_disk
    }

    /// Whether a removal has been decided for this entry
    pub fn pending_removal(&self) -> bool {
        self.state != EntryState::Live
    }

    /// Whether the last unpin must free this entry
    pub fn remove_when_unpinned(&self) -> bool {
        self.state == EntryState::PinnedPendingRelease
    }

    /// Check expiration against `now` (Unix millis)
    #[inline]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiration_time > 0 && self.expiration_time <= now
    }

    /// Check expiration against the current time
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Derive `expiration_time` from the TTL seeds when not already set
    pub fn finalize_expiration(&mut self, now: i64) {
        if self.created_at <= 0 {
            self.created_at = now;
        }
        if self.expiration_time > 0 {
            return;
        }
        let by_limit = if self.time_limit > 0 {
            Some(self.created_at + i64::from(self.time_limit) * 1000)
        } else {
            None
        };
        let by_inactivity = if self.inactivity > 0 {
            Some(now + i64::from(self.inactivity) * 1000)
        } else {
            None
        };
        self.expiration_time = match (by_limit, by_inactivity) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => NO_EXPIRATION,
        };
    }

    /// Slide the inactivity window on access, capped by the time limit
    pub fn touch(&mut self, now: i64) {
        if self.inactivity <= 0 {
            return;
        }
        let mut next = now + i64::from(self.inactivity) * 1000;
        if self.time_limit > 0 {
            next = next.min(self.created_at + i64::from(self.time_limit) * 1000);
        }
        self.expiration_time = next;
    }

    /// Approximate in-memory size in bytes
    pub fn estimated_size(&self) -> u64 {
        let value = self.value.as_ref().map(|v| v.len()).unwrap_or(0);
        let tags: usize = self
            .dependency_ids
            .iter()
            .chain(self.templates.iter())
            .chain(self.aliases.iter())
            .map(|s| s.len())
            .sum();
        (self.id.len() + value + tags) as u64
    }

    /// Every id this entry is reachable by
    pub fn all_ids(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.id).chain(self.aliases.iter())
    }

    /// Copy the caller-visible state of `other` into this slot
    ///
    /// Pool bookkeeping (`ref_count`, `lru_bucket`) is preserved so that a
    /// pinned identity survives an in-place update.
    pub(crate) fn copy_from(&mut self, other: CacheEntry) {
        let ref_count = self.ref_count;
        let lru_bucket = self.lru_bucket;
        *self = other;
        self.ref_count = ref_count;
        self.lru_bucket = lru_bucket;
        self.state = EntryState::Live;
    }

    /// Clear all state, keeping allocated capacity
    pub(crate) fn reset(&mut self) {
        self.id.clear();
        self.aliases.clear();
        self.value = None;
        self.serialized_value = None;
        self.dependency_ids.clear();
        self.templates.clear();
        self.priority = 0;
        self.time_limit = 0;
        self.inactivity = 0;
        self.expiration_time = NO_EXPIRATION;
        self.validator_expiration_time = NO_EXPIRATION;
        self.created_at = 0;
        self.sharing_policy = SharingPolicy::NotShared;
        self.persist_to_disk = false;
        self.skip_memory_and_write_to_disk = false;
        self.state = EntryState::Live;
        self.loaded_from_disk = false;
        self.ref_count = 0;
        self.lru_bucket = None;
    }

    /// Copy for handing out to callers, without pool bookkeeping
    ///
    /// The disk-origin flag stays with the resident slot; a caller writing
    /// the copy back is making a new write, not a promotion.
    pub(crate) fn snapshot(&self) -> CacheEntry {
        let mut copy = self.clone();
        copy.lru_bucket = None;
        copy.loaded_from_disk = false;
        copy
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (priority {}, refs {})", self.id, self.priority, self.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let entry = CacheEntry::new("product/42", "payload")
            .with_dependency("product")
            .with_template("/catalog.jsp")
            .with_alias("sku-42")
            .with_priority(3);

        assert_eq!(entry.id, "product/42");
        assert_eq!(entry.dependency_ids, vec!["product"]);
        assert_eq!(entry.templates, vec!["/catalog.jsp"]);
        assert_eq!(entry.all_ids().count(), 2);
        assert_eq!(entry.expiration_time, NO_EXPIRATION);
        assert!(entry.persist_to_disk);
        assert!(!entry.pending_removal());
    }

    #[test]
    fn test_expiration_from_time_limit() {
        let now = 1_000_000;
        let mut entry = CacheEntry::new("a", "v").with_time_limit(10);
        entry.finalize_expiration(now);
        assert_eq!(entry.expiration_time, now + 10_000);
        assert!(!entry.is_expired_at(now + 9_999));
        assert!(entry.is_expired_at(now + 10_000));
    }

    #[test]
    fn test_inactivity_capped_by_limit() {
        let now = 1_000_000;
        let mut entry = CacheEntry::new("a", "v").with_time_limit(10).with_inactivity(4);
        entry.finalize_expiration(now);
        assert_eq!(entry.expiration_time, now + 4_000);

        entry.touch(now + 8_000);
        assert_eq!(entry.expiration_time, now + 10_000);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let mut entry = CacheEntry::new("a", "v");
        entry.finalize_expiration(now_millis());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_copy_preserves_bookkeeping() {
        let mut slot = CacheEntry::new("a", "old");
        slot.ref_count = 2;
        slot.lru_bucket = Some(3);
        slot.state = EntryState::MarkedForRemoval;

        slot.copy_from(CacheEntry::new("a", "new"));
        assert_eq!(slot.ref_count, 2);
        assert_eq!(slot.lru_bucket, Some(3));
        assert_eq!(slot.state, EntryState::Live);
        assert_eq!(slot.value.as_deref(), Some(&b"new"[..]));

        slot.reset();
        assert!(slot.id.is_empty());
        assert_eq!(slot.ref_count, 0);
    }

    #[test]
    fn test_snapshot_drops_disk_origin() {
        let mut slot = CacheEntry::new("a", "v");
        slot.loaded_from_disk = true;
        slot.lru_bucket = Some(1);

        let copy = slot.snapshot();
        assert!(!copy.loaded_from_disk());
        assert_eq!(copy.lru_bucket, None);
        assert!(slot.loaded_from_disk());
    }
}
