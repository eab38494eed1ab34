//! Remote Services
//!
//! Port to peer caches. Coordination is advisory: a pull that fails is a
//! miss and a push that fails is dropped.

use crate::cache::entry::{CacheEntry, SharingPolicy};

/// Replication collaborator
pub trait RemoteServices: Send + Sync {
    /// Fetch an entry from a peer
    fn get_entry(&self, id: &str) -> Option<CacheEntry>;

    /// Whether a miss on `id` should be pulled from peers
    fn should_pull(&self, policy: SharingPolicy, id: &str) -> bool;

    /// Publish an entry to peers
    fn push_entry(&self, entry: &CacheEntry);

    /// Whether peers are reachable
    fn is_ready(&self) -> bool;
}

/// Stand-alone deployment: no peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemoteServices;

impl RemoteServices for NoopRemoteServices {
    fn get_entry(&self, _id: &str) -> Option<CacheEntry> {
        None
    }

    fn should_pull(&self, _policy: SharingPolicy, _id: &str) -> bool {
        false
    }

    fn push_entry(&self, _entry: &CacheEntry) {}

    fn is_ready(&self) -> bool {
        false
    }
}
