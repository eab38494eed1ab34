//! Tiered Cache Manager
//!
//! Memory tier coordinator. Owns the primary index, both tag indices and the
//! priority clock behind one lock, and moves entries between memory, disk
//! and peers.
//!
//! ```text
//!   get ──▶ memory ──miss──▶ disk (buffer-gated) ──miss──▶ remote
//!             ▲                   │                          │
//!             └──── promote ◀─────┴──────────────────────────┘
//!
//!   set ──▶ slot from pool ──full──▶ clock victim ──▶ spill to disk
//!                                                  └─▶ or drop
//! ```
//!
//! Lock order: memory state, then the disk tier's own locks. Listener
//! callbacks run after the memory lock is released, except the
//! `should_invalidate` veto which runs while it is held.

use crate::cache::dependency::DependencyIndex;
use crate::cache::disk::{DiskCache, EntryCodec, EventSink, JsonEntryCodec, RangeStep, TagKind};
use crate::cache::entry::{now_millis, CacheEntry, EntryState};
use crate::cache::events::{CacheEvent, CacheListener, ChangeCause, InvalidationCause, Source};
use crate::cache::expiration::ExpirationSchedule;
use crate::cache::lru::PriorityClock;
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot};
use crate::cache::pool::{EntryHandle, EntryPool};
use crate::cache::remote::{NoopRemoteServices, RemoteServices};
use crate::cache::scheduler::{Scheduler, TokioScheduler};
use crate::config::CacheConfig;
use crate::error::{DiskWriteStatus, Error, Result};
use bytes::Bytes;
use indexmap::IndexSet;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

type Listeners = Arc<RwLock<Vec<Arc<dyn CacheListener>>>>;

// =============================================================================
// Options and Results
// =============================================================================

/// Whether a write carries new content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentDirective {
    /// Store the entry as given
    #[default]
    CacheNewContent,
    /// The cached value was revalidated; keep it and adopt only the new
    /// expiration times. Falls back to a plain write when nothing is cached.
    UseCachedContent,
}

/// Options for [`TieredCache::set`]
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Where the write originated
    pub source: Source,
    pub directive: ContentDirective,
    /// Leave the write out of statistics
    pub ignore_stats: bool,
    /// Push the entry to peers when its sharing policy asks for it
    pub coordinate: bool,
    /// Return with the entry pinned; the caller must `unpin` it
    pub pin: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            source: Source::Memory,
            directive: ContentDirective::CacheNewContent,
            ignore_stats: false,
            coordinate: true,
            pin: false,
        }
    }
}

impl SetOptions {
    /// Default options with a pinned result
    pub fn pinned() -> Self {
        Self {
            pin: true,
            ..Default::default()
        }
    }

    /// Default options for a revalidated entry
    pub fn use_cached_content() -> Self {
        Self {
            directive: ContentDirective::UseCachedContent,
            ..Default::default()
        }
    }
}

/// Outcome of a set
#[derive(Debug, Clone)]
pub struct PutResult {
    /// The stored entry as seen after the write
    pub entry: CacheEntry,
    /// `None` when the write was a no-op
    pub cause: Option<ChangeCause>,
    /// Status of the disk write for direct-to-disk entries
    pub disk_status: Option<DiskWriteStatus>,
    /// Whether the caller holds a pin on the entry
    pub pinned: bool,
}

impl PutResult {
    fn unchanged(entry: CacheEntry) -> Self {
        Self {
            entry,
            cause: None,
            disk_status: None,
            pinned: false,
        }
    }
}

/// How an entry reached the memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A write through the public API
    Caller,
    /// A copy brought up from a lower tier
    Promotion { from_disk: bool },
    /// A disk record whose expiration was just extended
    Revalidation,
}

impl Origin {
    fn from_disk(self) -> bool {
        matches!(self, Origin::Promotion { from_disk: true } | Origin::Revalidation)
    }
}

enum Eviction {
    Freed,
    Vetoed,
    NoVictim,
}

// =============================================================================
// Memory State
// =============================================================================

/// Everything guarded by the coordinator lock
struct MemoryState {
    pool: EntryPool,
    /// Canonical ids and aliases, all pointing at the owning slot
    index: HashMap<String, EntryHandle>,
    dependencies: DependencyIndex,
    templates: DependencyIndex,
    clock: PriorityClock,
    expirations: ExpirationSchedule,
    /// Events raised under the lock, dispatched after release
    events: Vec<CacheEvent>,
}

impl MemoryState {
    fn new(config: &CacheConfig) -> Self {
        Self {
            pool: EntryPool::with_capacity(config.cache_size_limit),
            index: HashMap::new(),
            dependencies: DependencyIndex::new(),
            templates: DependencyIndex::new(),
            clock: PriorityClock::new(config.max_priority),
            expirations: ExpirationSchedule::new(),
            events: Vec::new(),
        }
    }

    fn lookup(&self, id: &str) -> Option<EntryHandle> {
        self.index.get(id).copied().filter(|h| self.pool.is_valid(*h))
    }

    /// Handle of the entry whose canonical id is `id`
    fn lookup_canonical(&self, id: &str) -> Option<EntryHandle> {
        self.lookup(id)
            .filter(|h| self.pool.get(*h).map(|e| e.id == id).unwrap_or(false))
    }

    /// Point `alias` at `handle`, taking it away from any other entry
    fn claim_alias(&mut self, alias: &str, handle: EntryHandle) -> bool {
        if let Some(other) = self.lookup(alias).filter(|other| *other != handle) {
            let Some(owner) = self.pool.get_mut(other) else {
                return false;
            };
            if owner.id == alias {
                return false;
            }
            owner.aliases.retain(|a| a != alias);
        }
        self.index.insert(alias.to_string(), handle);
        true
    }

    /// Index ids and tags of a freshly written slot and place it in the clock
    fn register(&mut self, handle: EntryHandle) {
        let Some(entry) = self.pool.get_mut(handle) else {
            return;
        };
        self.clock.update_location(handle, entry);
        for dependency in &entry.dependency_ids {
            self.dependencies.add(dependency, &entry.id);
        }
        for template in &entry.templates {
            self.templates.add(template, &entry.id);
        }
        self.expirations.schedule(&entry.id, entry.expiration_time);
        let id = entry.id.clone();
        let aliases = entry.aliases.clone();

        let mut rejected = Vec::new();
        for alias in aliases {
            if !self.claim_alias(&alias, handle) {
                rejected.push(alias);
            }
        }
        if let Some(entry) = self.pool.get_mut(handle) {
            entry.aliases.retain(|a| !rejected.contains(a));
        }
        self.index.insert(id, handle);
    }

    fn unregister_tags(&mut self, handle: EntryHandle) {
        let Some(entry) = self.pool.get(handle) else {
            return;
        };
        for dependency in &entry.dependency_ids {
            self.dependencies.remove_entry(dependency, &entry.id);
        }
        for template in &entry.templates {
            self.templates.remove_entry(template, &entry.id);
        }
    }

    fn unlink_ids(&mut self, handle: EntryHandle, keep_canonical: bool) {
        let Some(entry) = self.pool.get(handle) else {
            return;
        };
        let ids: Vec<String> = entry
            .all_ids()
            .filter(|id| !keep_canonical || **id != entry.id)
            .cloned()
            .collect();
        for id in ids {
            if self.index.get(&id) == Some(&handle) {
                self.index.remove(&id);
            }
        }
    }

    /// Detach an entry from every structure and return its slot to the pool
    fn free(&mut self, handle: EntryHandle) -> bool {
        self.unregister_tags(handle);
        self.unlink_ids(handle, false);
        if let Some(entry) = self.pool.get_mut(handle) {
            self.clock.remove(handle, entry);
            self.expirations.unschedule(&entry.id);
        }
        self.pool.release(handle)
    }

    fn clear(&mut self) {
        self.pool.clear();
        self.index.clear();
        self.dependencies.clear();
        self.templates.clear();
        self.clock.clear();
        self.expirations.clear();
    }
}

// =============================================================================
// Event Dispatch
// =============================================================================

fn dispatch_event(listeners: &RwLock<Vec<Arc<dyn CacheListener>>>, tx: &broadcast::Sender<CacheEvent>, event: CacheEvent) {
    let listeners = listeners.read().clone();
    match &event {
        CacheEvent::Changed { .. } => listeners.iter().for_each(|l| l.on_change(&event)),
        CacheEvent::Invalidated { .. } => listeners.iter().for_each(|l| l.on_invalidate(&event)),
        _ => {}
    }
    // No subscribers is fine
    let _ = tx.send(event);
}

// =============================================================================
// Tiered Cache
// =============================================================================

/// One cache instance: memory tier plus optional disk tier
pub struct TieredCache {
    pub(super) config: CacheConfig,
    state: Mutex<MemoryState>,
    pub(super) disk: RwLock<Option<Arc<DiskCache>>>,
    pub(super) swap_to_disk: AtomicBool,
    remote: Arc<dyn RemoteServices>,
    pub(super) scheduler: Arc<dyn Scheduler>,
    listeners: Listeners,
    event_tx: broadcast::Sender<CacheEvent>,
    metrics: Arc<CacheMetrics>,
    pub(super) started: AtomicBool,
    pub(super) stopped: AtomicBool,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.config.name)
            .field("entries", &self.len())
            .field("disk", &self.disk().is_some())
            .finish()
    }
}

impl TieredCache {
    /// Create a cache on the current tokio runtime with no peers
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        let scheduler = Arc::new(TokioScheduler::current()?);
        Self::with_services(config, scheduler, Arc::new(NoopRemoteServices))
    }

    /// Create a cache with explicit collaborators
    pub fn with_services(
        mut config: CacheConfig,
        scheduler: Arc<dyn Scheduler>,
        remote: Arc<dyn RemoteServices>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(CacheMetrics::new());
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);

        let disk = if config.disk.enabled {
            let sink: EventSink = {
                let listeners = Arc::clone(&listeners);
                let tx = event_tx.clone();
                Arc::new(move |event: CacheEvent| dispatch_event(&listeners, &tx, event))
            };
            let codec: Arc<dyn EntryCodec> = Arc::new(JsonEntryCodec::new(config.disk.compression));
            match DiskCache::open(
                &config.disk_cache_name(),
                config.disk.clone(),
                codec,
                Arc::clone(&scheduler),
                sink,
                Arc::clone(&metrics),
            ) {
                Ok(disk) => Some(disk),
                Err(e) => {
                    warn!(cache = %config.name, error = %e, "disk tier unavailable, running memory-only");
                    None
                }
            }
        } else {
            None
        };

        info!(
            cache = %config.name,
            limit = config.cache_size_limit,
            max_priority = config.max_priority,
            disk = disk.is_some(),
            "tiered cache initialized"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(MemoryState::new(&config)),
            swap_to_disk: AtomicBool::new(disk.is_some()),
            disk: RwLock::new(disk),
            config,
            remote,
            scheduler,
            listeners,
            event_tx,
            metrics,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    /// Register a synchronous listener
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Statistics snapshot with current gauges
    pub fn stats(&self) -> CacheStatsSnapshot {
        let (entries, overflow) = {
            let state = self.state.lock();
            (state.pool.in_use() as u64, state.pool.overflow_allocations())
        };
        let (disk_entries, disk_bytes) = self
            .disk()
            .map(|d| (d.len() as u64, d.bytes()))
            .unwrap_or((0, 0));
        self.metrics.snapshot(entries, overflow, disk_entries, disk_bytes)
    }

    /// Disk tier, if present and enabled
    pub(crate) fn disk(&self) -> Option<Arc<DiskCache>> {
        self.disk.read().as_ref().filter(|d| d.is_enabled()).cloned()
    }

    /// Disk tier, if memory entries may currently be written to it
    fn spill_target(&self) -> Option<Arc<DiskCache>> {
        if !self.swap_to_disk.load(Ordering::Acquire) {
            return None;
        }
        self.disk()
    }

    fn release(&self, mut state: MutexGuard<'_, MemoryState>) {
        let events = std::mem::take(&mut state.events);
        drop(state);
        self.dispatch(events);
    }

    fn dispatch(&self, events: Vec<CacheEvent>) {
        for event in events {
            dispatch_event(&self.listeners, &self.event_tx, event);
        }
    }

    fn should_invalidate(&self, id: &str, source: Source, cause: InvalidationCause) -> bool {
        self.listeners
            .read()
            .iter()
            .all(|l| l.should_invalidate(id, source, cause))
    }

    fn event_value(&self, value: &Option<Bytes>) -> Option<Bytes> {
        if self.config.ignore_value_in_invalidation_event {
            None
        } else {
            value.clone()
        }
    }

    // =========================================================================
    // Disk Failure Handling
    // =========================================================================

    /// React to a disk error: fatal ones turn the tier off, size limits
    /// trigger garbage collection
    fn on_disk_error(&self, disk: &Arc<DiskCache>, err: &Error) {
        if err.is_disk_fatal() {
            self.swap_to_disk.store(false, Ordering::Release);
            disk.disable(&err.to_string());
        } else if err.is_size_limit() {
            disk.invoke_gc_if_necessary();
        }
    }

    fn disk_write_failed(&self, disk: &Arc<DiskCache>, id: &str, err: &Error, events: &mut Vec<CacheEvent>) -> DiskWriteStatus {
        let status = err.disk_status();
        self.metrics.record_disk_write_failure();
        warn!(cache = %self.config.name, id, error = %err, status = ?status, "disk write failed");
        self.on_disk_error(disk, err);
        events.push(CacheEvent::DiskWriteFailed {
            id: id.to_string(),
            status,
        });
        status
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look up an entry in every tier, asking peers on a local miss
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.get_entry(id, true, true)
    }

    /// Look up an entry
    ///
    /// A memory hit refreshes the entry's clock position and inactivity
    /// window. An expired memory entry is invalidated and the lookup goes
    /// on as a miss. Disk and remote hits are promoted into memory.
    pub fn get_entry(&self, id: &str, ask_remote: bool, count_stats: bool) -> Option<CacheEntry> {
        let now = now_millis();
        {
            let mut state = self.state.lock();
            if let Some(handle) = state.lookup(id) {
                let (expired, pending, canonical) = match state.pool.get(handle) {
                    Some(e) => (e.is_expired_at(now), e.remove_when_unpinned(), e.id.clone()),
                    None => (false, false, String::new()),
                };
                if pending {
                    let snapshot = state.pool.get(handle).map(|e| e.snapshot());
                    drop(state);
                    if count_stats {
                        self.metrics.memory.record_hit();
                    }
                    return snapshot;
                }
                if expired {
                    self.remove_locked(&mut state, &canonical, InvalidationCause::Timeout, Source::Memory, true, false);
                    self.release(state);
                } else {
                    let snapshot = {
                        let MemoryState { pool, clock, .. } = &mut *state;
                        pool.get_mut(handle).map(|entry| {
                            entry.touch(now);
                            clock.update_location(handle, entry);
                            entry.snapshot()
                        })
                    };
                    drop(state);
                    if snapshot.is_some() && count_stats {
                        self.metrics.memory.record_hit();
                    }
                    return snapshot;
                }
            }
        }
        if count_stats {
            self.metrics.memory.record_miss();
        }

        if let Some(disk) = self.disk() {
            match disk.read(id) {
                Ok(Some(entry)) => {
                    if count_stats {
                        self.metrics.disk.record_hit();
                    }
                    return Some(self.promote(entry, Source::Disk));
                }
                Ok(None) => {
                    if count_stats {
                        self.metrics.disk.record_miss();
                    }
                }
                Err(e) => {
                    warn!(cache = %self.config.name, id, error = %e, "disk read failed");
                    self.on_disk_error(&disk, &e);
                }
            }
        }

        if ask_remote && self.remote.is_ready() && self.remote.should_pull(self.config.sharing_policy, id) {
            match self.remote.get_entry(id) {
                Some(entry) if !entry.is_expired_at(now) => {
                    if count_stats {
                        self.metrics.remote.record_hit();
                    }
                    return Some(self.promote(entry, Source::Remote));
                }
                _ => {
                    if count_stats {
                        self.metrics.remote.record_miss();
                    }
                }
            }
        }
        None
    }

    /// Load an entry found in another tier into memory
    ///
    /// Direct-to-disk entries are returned without entering memory.
    fn promote(&self, mut entry: CacheEntry, from: Source) -> CacheEntry {
        if entry.skip_memory_and_write_to_disk {
            entry.loaded_from_disk = false;
            return entry;
        }
        let id = entry.id.clone();
        let options = SetOptions {
            source: from,
            directive: ContentDirective::CacheNewContent,
            ignore_stats: true,
            coordinate: false,
            pin: false,
        };
        let origin = Origin::Promotion {
            from_disk: from == Source::Disk,
        };
        let mut state = self.state.lock();
        let result = self.set_locked(&mut state, entry, &options, origin);
        if result.cause.is_some() {
            self.metrics.record_promotion();
            state.events.push(CacheEvent::Promoted { id: id.clone(), from });
            debug!(cache = %self.config.name, id = %id, from = %from, "promoted entry into memory");
        }
        self.release(state);
        result.entry
    }

    // =========================================================================
    // Set
    // =========================================================================

    /// Store an entry with default options
    pub fn put(&self, entry: CacheEntry) -> Result<PutResult> {
        self.set(entry, SetOptions::default())
    }

    /// Store an entry
    ///
    /// Memory writes never fail because of the disk tier; a failed spill
    /// degrades to a plain invalidation of the victim. Direct-to-disk
    /// entries bypass memory and surface disk errors to the caller.
    pub fn set(&self, mut entry: CacheEntry, options: SetOptions) -> Result<PutResult> {
        if entry.id.is_empty() {
            return Err(Error::InvalidEntry("cache id must not be empty".into()));
        }
        entry.priority = entry.priority.min(self.config.max_priority);
        entry.finalize_expiration(now_millis());
        entry.loaded_from_disk = false;

        if options.directive == ContentDirective::UseCachedContent {
            if let Some(result) = self.revalidate(&entry, &options) {
                return Ok(result);
            }
        }
        if entry.skip_memory_and_write_to_disk {
            return self.write_direct_to_disk(entry, &options);
        }

        let mut state = self.state.lock();
        let result = self.set_locked(&mut state, entry, &options, Origin::Caller);
        self.release(state);

        if options.coordinate && result.entry.sharing_policy.pushes() && self.remote.is_ready() {
            self.remote.push_entry(&result.entry);
        }
        Ok(result)
    }

    /// Adopt new expiration times for content that is already cached
    ///
    /// A resident entry keeps its value and clock position. A record found
    /// only on disk is rewritten with the new times and brought into memory.
    /// `None` when neither tier holds the id.
    fn revalidate(&self, entry: &CacheEntry, options: &SetOptions) -> Option<PutResult> {
        let id = entry.id.as_str();
        let expiration = entry.expiration_time;
        let validator_expiration = entry.validator_expiration_time;

        let mut state = self.state.lock();
        if let Some(handle) = state.lookup_canonical(id) {
            let resident = state.pool.get_mut(handle).filter(|slot| !slot.pending_removal()).map(|slot| {
                slot.expiration_time = expiration;
                slot.validator_expiration_time = validator_expiration;
                if options.pin {
                    slot.ref_count += 1;
                }
                (slot.loaded_from_disk, slot.snapshot())
            });
            if let Some((from_disk, snapshot)) = resident {
                state.expirations.schedule(id, expiration);
                if from_disk {
                    if let Some(disk) = self.disk() {
                        if let Err(e) = disk.update_expiration_time(id, expiration, validator_expiration) {
                            warn!(cache = %self.config.name, id, error = %e, "could not revalidate disk copy");
                            self.on_disk_error(&disk, &e);
                        }
                    }
                }
                state
                    .events
                    .push(CacheEvent::changed(id, ChangeCause::ExpirationTimesChanged, options.source));
                self.release(state);
                debug!(cache = %self.config.name, id, expiration, "resident entry revalidated");
                return Some(PutResult {
                    entry: snapshot,
                    cause: Some(ChangeCause::ExpirationTimesChanged),
                    disk_status: None,
                    pinned: options.pin,
                });
            }
        }
        drop(state);

        let disk = self.disk()?;
        let mut cached = match disk.update_expiration_time(id, expiration, validator_expiration) {
            Ok(true) => match disk.read(id) {
                Ok(Some(cached)) => cached,
                Ok(None) => return None,
                Err(e) => {
                    warn!(cache = %self.config.name, id, error = %e, "disk read failed");
                    self.on_disk_error(&disk, &e);
                    return None;
                }
            },
            Ok(false) => return None,
            Err(e) => {
                warn!(cache = %self.config.name, id, error = %e, "could not revalidate disk copy");
                self.on_disk_error(&disk, &e);
                return None;
            }
        };
        cached.expiration_time = expiration;
        cached.validator_expiration_time = validator_expiration;
        debug!(cache = %self.config.name, id, expiration, "disk record revalidated");

        if cached.skip_memory_and_write_to_disk {
            cached.loaded_from_disk = false;
            self.dispatch(vec![CacheEvent::changed(id, ChangeCause::ExpirationTimesChanged, options.source)]);
            return Some(PutResult {
                entry: cached,
                cause: Some(ChangeCause::ExpirationTimesChanged),
                disk_status: None,
                pinned: false,
            });
        }
        let mut state = self.state.lock();
        let result = self.set_locked(&mut state, cached, options, Origin::Revalidation);
        self.release(state);
        Some(result)
    }

    fn set_locked(&self, state: &mut MemoryState, entry: CacheEntry, options: &SetOptions, origin: Origin) -> PutResult {
        let id = entry.id.clone();
        let from_disk = origin.from_disk();

        let (handle, cause) = match state.lookup_canonical(&id) {
            Some(handle) => {
                if from_disk {
                    // A disk copy never replaces a resident entry
                    let Some(existing) = state.pool.get_mut(handle) else {
                        return PutResult::unchanged(entry);
                    };
                    if options.pin {
                        existing.ref_count += 1;
                    }
                    return PutResult {
                        entry: existing.snapshot(),
                        cause: None,
                        disk_status: None,
                        pinned: options.pin,
                    };
                }
                let stale_on_disk = state.pool.get(handle).map(|e| e.loaded_from_disk).unwrap_or(false);
                if stale_on_disk {
                    self.delete_disk_copy(&id);
                }
                state.unregister_tags(handle);
                state.unlink_ids(handle, true);
                if let Some(slot) = state.pool.get_mut(handle) {
                    slot.copy_from(entry);
                    slot.loaded_from_disk = false;
                }
                (handle, ChangeCause::ExistingValueChanged)
            }
            None => {
                if let Some(owner) = state.lookup(&id) {
                    if let Some(owner) = state.pool.get_mut(owner) {
                        owner.aliases.retain(|a| *a != id);
                    }
                    state.index.remove(&id);
                }
                if !from_disk {
                    if let Some(disk) = self.disk().filter(|d| d.contains(&id)) {
                        if let Err(e) = disk.delete(&id) {
                            self.on_disk_error(&disk, &e);
                        }
                    }
                }
                let handle = self.acquire_slot(state);
                if let Some(slot) = state.pool.get_mut(handle) {
                    slot.copy_from(entry);
                    slot.loaded_from_disk = from_disk;
                }
                let cause = match origin {
                    Origin::Revalidation => ChangeCause::ExpirationTimesChanged,
                    _ => ChangeCause::NewEntryAdded,
                };
                (handle, cause)
            }
        };

        state.register(handle);
        let snapshot = match state.pool.get_mut(handle) {
            Some(slot) => {
                if options.pin {
                    slot.ref_count += 1;
                }
                slot.snapshot()
            }
            None => return PutResult::unchanged(CacheEntry::default()),
        };

        if !options.ignore_stats {
            self.metrics.memory.record_write();
        }
        state.events.push(CacheEvent::changed(&id, cause, options.source));
        debug!(cache = %self.config.name, id = %id, cause = ?cause, source = %options.source, "entry stored");
        PutResult {
            entry: snapshot,
            cause: Some(cause),
            disk_status: None,
            pinned: options.pin,
        }
    }

    fn write_direct_to_disk(&self, entry: CacheEntry, options: &SetOptions) -> Result<PutResult> {
        let Some(disk) = self.spill_target() else {
            warn!(cache = %self.config.name, id = %entry.id, "direct-to-disk write with no disk tier");
            return Err(Error::DiskUnavailable);
        };

        // A resident copy would shadow the new record
        {
            let mut state = self.state.lock();
            if let Some(handle) = state.lookup_canonical(&entry.id) {
                self.discard_from_memory(&mut state, handle, false);
            }
        }

        match disk.write_with_tags(&entry) {
            Ok(status) => {
                let cause = if status == DiskWriteStatus::NoExceptionEntryOverwritten {
                    ChangeCause::ExistingValueChanged
                } else {
                    ChangeCause::NewEntryAdded
                };
                debug!(cache = %self.config.name, id = %entry.id, status = ?status, "direct-to-disk write");
                self.dispatch(vec![CacheEvent::changed(&entry.id, cause, options.source)]);
                Ok(PutResult {
                    entry,
                    cause: Some(cause),
                    disk_status: Some(status),
                    pinned: false,
                })
            }
            Err(e) => {
                let mut events = Vec::new();
                self.disk_write_failed(&disk, &entry.id, &e, &mut events);
                self.dispatch(events);
                Err(e)
            }
        }
    }

    fn delete_disk_copy(&self, id: &str) {
        if let Some(disk) = self.disk() {
            if let Err(e) = disk.delete(id) {
                warn!(cache = %self.config.name, id, error = %e, "could not queue disk delete");
                self.on_disk_error(&disk, &e);
            }
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Slot for a new entry, evicting or overflowing when memory is full
    fn acquire_slot(&self, state: &mut MemoryState) -> EntryHandle {
        let limit = self.config.cache_size_limit;
        let mut attempts = state.clock.len().max(1);
        while state.pool.in_use() >= limit && attempts > 0 {
            attempts -= 1;
            match self.free_lru_entry(state) {
                Eviction::Freed | Eviction::Vetoed => {}
                Eviction::NoVictim => break,
            }
        }
        if state.pool.in_use() >= limit {
            debug!(cache = %self.config.name, in_use = state.pool.in_use(), "no evictable entry, overflow allocation");
            return state.pool.allocate_overflow();
        }
        state.pool.allocate()
    }

    /// Evict the clock's next victim, spilling it to disk when possible
    fn free_lru_entry(&self, state: &mut MemoryState) -> Eviction {
        let Some(victim) = state.clock.select_victim(&mut state.pool) else {
            return Eviction::NoVictim;
        };
        let Some((entry, from_disk)) = state.pool.get(victim).map(|e| (e.snapshot(), e.loaded_from_disk)) else {
            return Eviction::NoVictim;
        };

        if !self.should_invalidate(&entry.id, Source::Memory, InvalidationCause::LruEvicted) {
            if let Some(slot) = state.pool.get_mut(victim) {
                state.clock.requeue(victim, slot);
            }
            debug!(cache = %self.config.name, id = %entry.id, "eviction vetoed by listener");
            return Eviction::Vetoed;
        }

        self.lru_to_disk(state, &entry, from_disk);
        state.free(victim);
        self.metrics.memory.record_eviction();
        Eviction::Freed
    }

    /// Move an evicted entry down a tier, or invalidate it
    ///
    /// An entry promoted from disk is already stored there; only its
    /// expiration times are carried back. If that record is gone the entry
    /// is spilled like any other.
    fn lru_to_disk(&self, state: &mut MemoryState, entry: &CacheEntry, from_disk: bool) {
        if let Some(disk) = self.disk().filter(|_| from_disk) {
            match disk.update_expiration_time(&entry.id, entry.expiration_time, entry.validator_expiration_time) {
                Ok(true) => {
                    debug!(cache = %self.config.name, id = %entry.id, "evicted entry already on disk");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %self.config.name, id = %entry.id, error = %e, "could not update disk expiration");
                    self.on_disk_error(&disk, &e);
                }
            }
        }
        let target = if entry.persist_to_disk { self.spill_target() } else { None };
        let cause = match target {
            Some(disk) => match disk.write_with_tags(entry) {
                Ok(status) => {
                    self.metrics.memory.record_spill();
                    state.events.push(CacheEvent::Spilled {
                        id: entry.id.clone(),
                        size_bytes: entry.estimated_size(),
                        overwritten: status == DiskWriteStatus::NoExceptionEntryOverwritten,
                    });
                    debug!(cache = %self.config.name, id = %entry.id, "spilled entry to disk");
                    return;
                }
                Err(e) => {
                    self.disk_write_failed(&disk, &entry.id, &e, &mut state.events);
                    if e.is_size_limit() {
                        InvalidationCause::DiskOverflow
                    } else {
                        InvalidationCause::LruEvicted
                    }
                }
            },
            None => InvalidationCause::LruEvicted,
        };
        self.metrics.record_invalidation(cause);
        state.events.push(CacheEvent::invalidated(
            &entry.id,
            cause,
            Source::Memory,
            self.event_value(&entry.value),
        ));
        debug!(cache = %self.config.name, id = %entry.id, cause = %cause, "evicted entry dropped");
    }

    // =========================================================================
    // Remove and Invalidate
    // =========================================================================

    /// Invalidate one id (no tag cascade)
    pub fn remove(&self, id: &str, cause: InvalidationCause, source: Source, fire: bool, from_tag_cascade: bool) -> bool {
        let mut state = self.state.lock();
        let removed = self.remove_locked(&mut state, id, cause, source, fire, from_tag_cascade);
        self.release(state);
        removed
    }

    /// Mark a resident entry for removal and free it unless pinned
    fn discard_from_memory(&self, state: &mut MemoryState, handle: EntryHandle, delete_disk_copy: bool) {
        let Some(entry) = state.pool.get_mut(handle) else {
            return;
        };
        entry.state = EntryState::MarkedForRemoval;
        let from_disk = entry.loaded_from_disk;
        let id = entry.id.clone();
        let pinned = entry.ref_count > 0;

        state.unregister_tags(handle);
        {
            let MemoryState { pool, clock, .. } = &mut *state;
            if let Some(entry) = pool.get_mut(handle) {
                clock.remove(handle, entry);
            }
        }
        if delete_disk_copy && from_disk {
            self.delete_disk_copy(&id);
        }
        if pinned {
            if let Some(entry) = state.pool.get_mut(handle) {
                entry.state = EntryState::PinnedPendingRelease;
            }
            debug!(cache = %self.config.name, id = %id, "removal deferred until unpinned");
        } else {
            state.free(handle);
        }
    }

    fn remove_locked(
        &self,
        state: &mut MemoryState,
        id: &str,
        cause: InvalidationCause,
        source: Source,
        fire: bool,
        from_tag_cascade: bool,
    ) -> bool {
        let (event_id, event_value) = match state.lookup(id) {
            Some(handle) => {
                let Some(entry) = state.pool.get(handle) else {
                    return false;
                };
                if entry.pending_removal() {
                    return false;
                }
                let value = self.event_value(&entry.value);
                let canonical = entry.id.clone();
                self.discard_from_memory(state, handle, true);
                self.metrics.memory.record_removal();
                (canonical, value)
            }
            None => {
                let Some(disk) = self.disk() else {
                    return false;
                };
                if !disk.contains(id) {
                    return false;
                }
                let value = if fire && !from_tag_cascade && !self.config.ignore_value_in_invalidation_event {
                    disk.read(id).ok().flatten().and_then(|e| e.value)
                } else {
                    None
                };
                if let Err(e) = disk.delete(id) {
                    warn!(cache = %self.config.name, id, error = %e, "could not queue disk delete");
                    self.on_disk_error(&disk, &e);
                }
                (id.to_string(), value)
            }
        };

        self.metrics.record_invalidation(cause);
        if fire {
            state.events.push(CacheEvent::invalidated(&event_id, cause, source, event_value));
        }
        debug!(cache = %self.config.name, id, cause = %cause, source = %source, "entry invalidated");
        true
    }

    /// Invalidate a cache id with defaults (explicit, local, with cascade)
    pub fn invalidate(&self, id: &str) -> bool {
        self.invalidate_by_id(id, InvalidationCause::Explicit, Source::Memory, true)
    }

    /// Invalidate `id` as a cache id and, with `cascade`, every entry that
    /// lists `id` as a dependency, in memory and on disk
    pub fn invalidate_by_id(&self, id: &str, cause: InvalidationCause, source: Source, cascade: bool) -> bool {
        let mut state = self.state.lock();
        let mut removed = self.remove_locked(&mut state, id, cause, source, true, false);
        if cascade {
            let members = self.take_tag_members(&mut state, TagKind::Dependency, id);
            let count = members.len();
            for member in members {
                removed |= self.remove_locked(&mut state, &member, cause, source, true, true);
            }
            if count > 0 {
                debug!(cache = %self.config.name, dependency = id, members = count, "dependency invalidated");
            }
        }
        self.release(state);
        removed
    }

    /// Invalidate every entry grouped under a template; returns the number
    /// of entries removed
    pub fn invalidate_by_template(&self, template: &str, source: Source) -> usize {
        let mut state = self.state.lock();
        let members = self.take_tag_members(&mut state, TagKind::Template, template);
        let removed = members
            .iter()
            .filter(|member| self.remove_locked(&mut state, member, InvalidationCause::Explicit, source, true, true))
            .count();
        debug!(cache = %self.config.name, template, removed, "template invalidated");
        self.release(state);
        removed
    }

    fn take_tag_members(&self, state: &mut MemoryState, kind: TagKind, tag: &str) -> IndexSet<String> {
        let mut members = match kind {
            TagKind::Dependency => state.dependencies.remove_dependency(tag),
            TagKind::Template => state.templates.remove_dependency(tag),
        };
        if let Some(disk) = self.disk() {
            match disk.read_tag(kind, tag, true) {
                Ok(ids) => members.extend(ids),
                Err(e) => {
                    warn!(cache = %self.config.name, tag, error = %e, "disk tag read failed");
                    self.on_disk_error(&disk, &e);
                }
            }
        }
        members
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Take a lease on a resident entry
    pub fn pin(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.lookup(id) else {
            return false;
        };
        match state.pool.get_mut(handle) {
            Some(entry) if !entry.pending_removal() => {
                entry.ref_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop a lease; the last one frees an entry removed while pinned
    pub fn unpin(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.lookup(id) else {
            return false;
        };
        let Some(entry) = state.pool.get_mut(handle) else {
            return false;
        };
        if entry.ref_count == 0 {
            warn!(cache = %self.config.name, id, "unpin without matching pin");
            return false;
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 && entry.remove_when_unpinned() {
            let canonical = entry.id.clone();
            state.free(handle);
            debug!(cache = %self.config.name, id = %canonical, "released entry after last unpin");
        }
        true
    }

    // =========================================================================
    // Aliases and Tags
    // =========================================================================

    /// Make `alias` resolve to the entry for `id`
    pub fn add_alias(&self, id: &str, alias: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(handle) = state.lookup(id) {
            let live = state.pool.get(handle).map(|e| !e.pending_removal()).unwrap_or(false);
            if !live || !state.claim_alias(alias, handle) {
                return false;
            }
            if let Some(entry) = state.pool.get_mut(handle) {
                if !entry.aliases.iter().any(|a| a == alias) {
                    entry.aliases.push(alias.to_string());
                }
            }
            return true;
        }
        drop(state);
        match self.disk() {
            Some(disk) => disk.add_alias(id, alias).unwrap_or_else(|e| {
                self.on_disk_error(&disk, &e);
                false
            }),
            None => false,
        }
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(handle) = state.lookup(alias) {
            let Some(entry) = state.pool.get_mut(handle) else {
                return false;
            };
            if entry.id == alias {
                return false;
            }
            entry.aliases.retain(|a| a != alias);
            state.index.remove(alias);
            return true;
        }
        drop(state);
        match self.disk() {
            Some(disk) => disk.remove_alias(alias).unwrap_or_else(|e| {
                self.on_disk_error(&disk, &e);
                false
            }),
            None => false,
        }
    }

    /// Ids grouped under a dependency id in either tier
    pub fn get_ids_by_dependency(&self, dependency: &str) -> IndexSet<String> {
        self.tag_members(TagKind::Dependency, dependency)
    }

    /// Ids grouped under a template in either tier
    pub fn get_ids_by_template(&self, template: &str) -> IndexSet<String> {
        self.tag_members(TagKind::Template, template)
    }

    fn tag_members(&self, kind: TagKind, tag: &str) -> IndexSet<String> {
        let mut ids = {
            let state = self.state.lock();
            let index = match kind {
                TagKind::Dependency => &state.dependencies,
                TagKind::Template => &state.templates,
            };
            index.entries_for(tag).cloned().unwrap_or_default()
        };
        if let Some(disk) = self.disk() {
            match disk.read_tag(kind, tag, false) {
                Ok(on_disk) => ids.extend(on_disk),
                Err(e) => self.on_disk_error(&disk, &e),
            }
        }
        ids
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Canonical ids of resident entries
    pub fn cache_ids(&self) -> IndexSet<String> {
        let state = self.state.lock();
        state
            .index
            .iter()
            .filter(|(key, handle)| state.pool.get(**handle).map(|e| e.id == **key).unwrap_or(false))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Dependency ids with resident members
    pub fn dependency_ids(&self) -> IndexSet<String> {
        self.state.lock().dependencies.tags().cloned().collect()
    }

    /// Templates with resident members
    pub fn templates(&self) -> IndexSet<String> {
        self.state.lock().templates.tags().cloned().collect()
    }

    /// Dependency ids known to either tier
    pub fn all_dependency_ids(&self) -> IndexSet<String> {
        let mut tags = self.dependency_ids();
        if let Some(disk) = self.disk() {
            tags.extend(disk.tags(TagKind::Dependency));
        }
        tags
    }

    /// Page through the ids on disk; `length` of `None` takes the rest
    pub fn ids_by_range_disk(&self, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        self.disk().map(|d| d.ids_by_range(step, length)).unwrap_or_default()
    }

    pub fn dependency_ids_by_range_disk(&self, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        self.disk()
            .map(|d| d.tags_by_range(TagKind::Dependency, step, length))
            .unwrap_or_default()
    }

    pub fn templates_by_range_disk(&self, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        self.disk()
            .map(|d| d.tags_by_range(TagKind::Template, step, length))
            .unwrap_or_default()
    }

    /// Ids queued for deletion on disk
    pub fn pending_removal_size_disk(&self) -> usize {
        self.disk().map(|d| d.pending_removal_size()).unwrap_or(0)
    }

    /// Dependency ids held in the disk delay-offload buffer
    pub fn dependency_ids_buffered_size_disk(&self) -> usize {
        self.disk().map(|d| d.buffered_tag_count(TagKind::Dependency)).unwrap_or(0)
    }

    /// Templates held in the disk delay-offload buffer
    pub fn templates_buffered_size_disk(&self) -> usize {
        self.disk().map(|d| d.buffered_tag_count(TagKind::Template)).unwrap_or(0)
    }

    // =========================================================================
    // Expiration
    // =========================================================================

    /// Set a resident entry's expiration and schedule it for the sweep
    pub fn add_to_expiration_schedule(&self, id: &str, expiration_time: i64, inactivity: i32) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.lookup_canonical(id) else {
            return false;
        };
        let Some(entry) = state.pool.get_mut(handle) else {
            return false;
        };
        entry.expiration_time = expiration_time;
        entry.inactivity = inactivity;
        state.expirations.schedule(id, expiration_time);
        true
    }

    /// Invalidate resident entries whose expiration has passed; returns the
    /// number invalidated
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut state = self.state.lock();
        let due = state.expirations.pop_due(now);

        let mut expired = 0;
        for id in due {
            let Some(handle) = state.lookup_canonical(&id) else {
                continue;
            };
            let Some(expiration) = state.pool.get(handle).map(|e| e.expiration_time) else {
                continue;
            };
            if expiration > 0 && expiration <= now {
                if self.remove_locked(&mut state, &id, InvalidationCause::Timeout, Source::Memory, true, false) {
                    expired += 1;
                }
            } else {
                // Inactivity pushed the deadline out since it was scheduled
                state.expirations.schedule(&id, expiration);
            }
        }
        if expired > 0 {
            debug!(cache = %self.config.name, expired, "expiration sweep");
        }
        self.release(state);
        expired
    }

    // =========================================================================
    // Whole-Cache Operations
    // =========================================================================

    /// Resident entries, including overflow allocations
    pub fn len(&self) -> usize {
        self.state.lock().pool.in_use()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in the disk tier
    pub fn disk_len(&self) -> usize {
        self.disk().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether `id` resolves in memory or on disk
    pub fn contains_key(&self, id: &str) -> bool {
        let resident = {
            let state = self.state.lock();
            state.lookup(id).is_some()
        };
        resident || self.disk().map(|d| d.contains(id)).unwrap_or(false)
    }

    /// Remove every entry from both tiers
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        let memory_entries = state.pool.in_use() as u64;
        state.clear();
        let disk_entries = match self.disk() {
            Some(disk) => match disk.clear() {
                Ok(n) => n as u64,
                Err(e) => {
                    self.on_disk_error(&disk, &e);
                    self.release(state);
                    return Err(e);
                }
            },
            None => 0,
        };
        for _ in 0..memory_entries + disk_entries {
            self.metrics.record_invalidation(InvalidationCause::ClearAll);
        }
        state.events.push(CacheEvent::Cleared {
            memory_entries,
            disk_entries,
        });
        info!(cache = %self.config.name, memory_entries, disk_entries, "cache cleared");
        self.release(state);
        Ok(())
    }

    /// Empty the memory tier
    ///
    /// With `clear_disk` the disk tier is emptied as well. Otherwise
    /// resident entries are first written to disk when spilling is on.
    /// Listeners are not told about individual entries; one `Cleared`
    /// event is raised.
    pub fn clear_memory(&self, clear_disk: bool) -> Result<()> {
        let mut disk_entries = 0;
        if let Some(disk) = self.disk() {
            if clear_disk {
                disk_entries = disk.clear().map_err(|e| {
                    self.on_disk_error(&disk, &e);
                    e
                })? as u64;
            } else if self.swap_to_disk.load(Ordering::Acquire) {
                let flushed = self.flush_memory_to_disk(&disk);
                debug!(cache = %self.config.name, flushed, "memory flushed before clear");
            }
        }

        let mut state = self.state.lock();
        let memory_entries = state.pool.in_use() as u64;
        state.clear();
        for _ in 0..memory_entries {
            self.metrics.record_invalidation(InvalidationCause::ClearAll);
        }
        state.events.push(CacheEvent::Cleared {
            memory_entries,
            disk_entries,
        });
        info!(cache = %self.config.name, memory_entries, disk_entries, "memory tier cleared");
        self.release(state);
        Ok(())
    }

    /// Evict entries allocated past the size limit; returns how many went
    pub fn trim_cache(&self) -> usize {
        let limit = self.config.cache_size_limit;
        let mut state = self.state.lock();
        let excess = state.pool.in_use().saturating_sub(limit);
        let mut removed = 0;
        for _ in 0..excess {
            match self.free_lru_entry(&mut state) {
                Eviction::Freed => removed += 1,
                Eviction::Vetoed | Eviction::NoVictim => break,
            }
        }
        if excess > 0 {
            debug!(cache = %self.config.name, excess, removed, "cache trimmed");
        }
        self.release(state);
        removed
    }

    /// Move a resident entry to the most recently used end of its bucket
    pub fn refresh_entry(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(handle) = state.lookup(id) else {
            return false;
        };
        let MemoryState { pool, clock, .. } = &mut *state;
        match pool.get_mut(handle) {
            Some(entry) if !entry.pending_removal() => {
                clock.refresh(handle, entry);
                true
            }
            _ => false,
        }
    }

    /// Store an entry and return the value it replaced, from either tier
    pub fn invalidate_and_set(&self, entry: CacheEntry) -> Result<Option<Bytes>> {
        let previous = self.get_entry(&entry.id, false, false).and_then(|e| e.value);
        self.set(entry, SetOptions::default())?;
        Ok(previous)
    }

    /// Write every evictable resident entry to disk; returns the number
    /// written
    pub(super) fn flush_memory_to_disk(&self, disk: &Arc<DiskCache>) -> usize {
        let state = self.state.lock();
        let candidates: Vec<CacheEntry> = state
            .index
            .iter()
            .filter_map(|(key, handle)| state.pool.get(*handle).filter(|e| e.id == *key))
            .filter(|e| e.persist_to_disk && !e.loaded_from_disk && !e.pending_removal())
            .map(|e| e.snapshot())
            .collect();

        let mut written = 0;
        for entry in &candidates {
            match disk.write_with_tags(entry) {
                Ok(_) => written += 1,
                Err(e) if e.is_disk_fatal() => {
                    warn!(cache = %self.config.name, error = %e, "flush to disk aborted");
                    break;
                }
                Err(e) => {
                    debug!(cache = %self.config.name, id = %entry.id, error = %e, "entry not flushed");
                }
            }
        }
        drop(state);
        written
    }
}
