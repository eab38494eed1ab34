//! Disk Tier
//!
//! Overflow store for entries evicted from memory, and the target of
//! direct-to-disk writes.
//!
//! ```text
//!                         DiskCache
//!   ┌──────────────────────────────────────────────────────────┐
//!   │  RwLock<DiskStore>                                       │
//!   │  ┌────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//!   │  │ DiskTable  │  │ dependency table │  │ template tbl │  │
//!   │  │ (objects)  │  │ + delay offload  │  │ + offload    │  │
//!   │  └────────────┘  └──────────────────┘  └──────────────┘  │
//!   │                                                          │
//!   │  Mutex<InvalidationBuffer>   explicit / scan / gc        │
//!   │  Mutex<EvictionHeap>         expiration-ordered shadows  │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order is store, then invalidation buffer, then heap. Deletes are
//! deferred through the invalidation buffer; a read treats any buffered id
//! as absent. Physical deletion happens only in [`DiskCache::drain`].

pub mod cleanup;
pub mod codec;
pub mod delay_offload;
pub mod eviction;
pub mod invalidation;
pub mod layout;
pub mod listing;
pub mod store;
pub mod table;
pub mod value_set;

pub use cleanup::{calculate_sleep_time, CleanupStats, DrainStats, GcStats};
pub use codec::{EntryCodec, JsonEntryCodec};
pub use eviction::{DiskEvictionPolicy, EvictionEntry, EvictionHeap};
pub use invalidation::{BufferCounts, BufferKind, InvalidationBuffer};
pub use layout::{DiskLayout, DiskProperties, OpenState};
pub use listing::RangeStep;
pub use store::{record_size, DiskStore};

use crate::cache::entry::{id_hash, now_millis, CacheEntry};
use crate::cache::events::CacheEvent;
use crate::cache::metrics::CacheMetrics;
use crate::cache::scheduler::Scheduler;
use crate::config::DiskConfig;
use crate::error::{DiskWriteStatus, Error, Result};
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use self::listing::{Listing, PageCursor};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use self::table::RecordHeader;
use tracing::{debug, info, warn};

/// Receiver of events raised by the disk tier
pub type EventSink = Arc<dyn Fn(CacheEvent) + Send + Sync>;

fn payload_hash(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(payload);
    hasher.finish()
}

/// Which tag table an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Dependency,
    Template,
}

/// Disk tier of one cache instance
pub struct DiskCache {
    name: String,
    config: DiskConfig,
    layout: DiskLayout,
    store: RwLock<DiskStore>,
    invalidations: Mutex<InvalidationBuffer>,
    heap: Mutex<EvictionHeap>,
    /// Paging position of each listing
    cursors: Mutex<HashMap<Listing, PageCursor>>,
    codec: Arc<dyn EntryCodec>,
    scheduler: Arc<dyn Scheduler>,
    sink: EventSink,
    metrics: Arc<CacheMetrics>,
    enabled: AtomicBool,
    stopping: AtomicBool,
    cleanup_running: AtomicBool,
    gc_running: AtomicBool,
    last_scan: AtomicI64,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("name", &self.name)
            .field("root", &self.layout.root())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl DiskCache {
    /// Open (or recover) the disk tier for the cache `name`
    pub fn open(
        name: &str,
        config: DiskConfig,
        codec: Arc<dyn EntryCodec>,
        scheduler: Arc<dyn Scheduler>,
        sink: EventSink,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Arc<Self>> {
        let layout = DiskLayout::new(&config.location, name);
        let state = layout.open()?;
        let mut store = DiskStore::open(&layout, &config)?;

        let (deps, templates) = store.enable_persisted_tag_tables();
        if deps {
            warn!(cache = name, "dependency ids disabled but persisted on disk, keeping them enabled");
        }
        if templates {
            warn!(cache = name, "templates disabled but persisted on disk, keeping them enabled");
        }

        let mut heap = EvictionHeap::new();
        for header in store.object_headers() {
            heap.insert(EvictionEntry::new(
                header.key.clone(),
                header.expiration,
                id_hash(&header.key),
                header.size,
            ));
        }

        info!(
            cache = name,
            root = %layout.root().display(),
            state = ?state,
            entries = store.len(),
            bytes = store.bytes(),
            "disk tier opened"
        );

        let last_scan = layout.read_last_scan().unwrap_or_else(now_millis);
        Ok(Arc::new(Self {
            name: name.to_string(),
            invalidations: Mutex::new(InvalidationBuffer::new(config.invalidation_buffer_size)),
            config,
            layout,
            store: RwLock::new(store),
            heap: Mutex::new(heap),
            cursors: Mutex::new(HashMap::new()),
            codec,
            scheduler,
            sink,
            metrics,
            enabled: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            cleanup_running: AtomicBool::new(false),
            gc_running: AtomicBool::new(false),
            last_scan: AtomicI64::new(last_scan),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Turn the tier off for the rest of the process; returns false if it
    /// was already off
    pub fn disable(&self, reason: &str) -> bool {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        warn!(cache = %self.name, reason, "disk tier disabled");
        self.emit(CacheEvent::DiskDisabled {
            reason: reason.to_string(),
        });
        true
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        (self.sink)(event);
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Object records on disk, including ones pending deletion
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted bytes on disk
    pub fn bytes(&self) -> u64 {
        self.store.read().bytes()
    }

    pub fn pending_invalidations(&self) -> BufferCounts {
        self.invalidations.lock().counts()
    }

    /// Shadows tracked by the eviction heap
    pub fn heap_len(&self) -> usize {
        self.heap.lock().len()
    }

    // =========================================================================
    // Object Records
    // =========================================================================

    /// Whether a live record exists for `id` (alias or canonical)
    pub fn contains(&self, id: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let store = self.store.read();
        let buffer = self.invalidations.lock();
        if buffer.contains(id) {
            return false;
        }
        match store.resolve(id) {
            Some(canonical) => !buffer.contains(&canonical),
            None => false,
        }
    }

    /// Write an entry's object record and alias records
    pub fn write(&self, entry: &CacheEntry) -> Result<DiskWriteStatus> {
        self.write_record(entry).map(|(status, _)| status)
    }

    /// Write the object record, returning the header it replaced
    fn write_record(&self, entry: &CacheEntry) -> Result<(DiskWriteStatus, Option<RecordHeader>)> {
        if !self.is_enabled() {
            return Err(Error::DiskUnavailable);
        }
        let payload = self.codec.serialize(entry)?;
        let size = record_size(&entry.id, payload.len());
        let header = RecordHeader {
            key: entry.id.clone(),
            alias_of: None,
            expiration: entry.expiration_time,
            validator_expiration: entry.validator_expiration_time,
            value_hash: payload_hash(&payload),
            size,
            aliases: entry.aliases.clone(),
            dependency_ids: entry.dependency_ids.clone(),
            templates: entry.templates.clone(),
        };

        let previous = {
            let mut store = self.store.write();
            let previous = store.put_record(header, &payload)?;
            {
                let mut buffer = self.invalidations.lock();
                for id in entry.all_ids() {
                    buffer.remove(id);
                }
            }
            let mut heap = self.heap.lock();
            let hash = id_hash(&entry.id);
            let shadow = EvictionEntry::new(entry.id.clone(), entry.expiration_time, hash, size);
            let unchanged = heap
                .get(&entry.id)
                .map(|e| e.expiration == shadow.expiration && e.size == size)
                .unwrap_or(false);
            if !unchanged {
                if let Some(previous) = &previous {
                    heap.find_and_remove(&entry.id, previous.expiration, hash, previous.size);
                }
                heap.insert(shadow);
            }
            previous
        };

        self.metrics.disk.record_write();
        debug!(cache = %self.name, id = %entry.id, size, overwritten = previous.is_some(), "disk write");
        let status = if previous.is_some() {
            DiskWriteStatus::NoExceptionEntryOverwritten
        } else {
            DiskWriteStatus::NoException
        };
        Ok((status, previous))
    }

    /// Write an entry together with its tag associations
    ///
    /// Tags the overwritten record carried and the entry no longer does are
    /// dropped. If a tag write fails the object record is queued for
    /// deletion, so the entry is never left half-written.
    pub fn write_with_tags(&self, entry: &CacheEntry) -> Result<DiskWriteStatus> {
        let (status, previous) = self.write_record(entry)?;
        let tagged = (|| -> Result<()> {
            if let Some(previous) = &previous {
                for tag in previous.dependency_ids.iter().filter(|t| !entry.dependency_ids.contains(t)) {
                    self.remove_tag_entry(TagKind::Dependency, tag, &entry.id)?;
                }
                for template in previous.templates.iter().filter(|t| !entry.templates.contains(t)) {
                    self.remove_tag_entry(TagKind::Template, template, &entry.id)?;
                }
            }
            for tag in &entry.dependency_ids {
                self.write_tag_entry(TagKind::Dependency, tag, &entry.id)?;
            }
            for template in &entry.templates {
                self.write_tag_entry(TagKind::Template, template, &entry.id)?;
            }
            Ok(())
        })();
        if let Err(e) = tagged {
            warn!(cache = %self.name, id = %entry.id, error = %e, "tag write failed, rolling back record");
            self.delete(&entry.id)?;
            return Err(e);
        }
        Ok(status)
    }

    /// Read an entry, following aliases
    ///
    /// Buffered ids are misses. An expired record is a miss and is queued
    /// for deletion together with its aliases.
    pub fn read(&self, id: &str) -> Result<Option<CacheEntry>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let now = now_millis();
        let (canonical, payload, expired, times) = {
            let store = self.store.read();
            let Some(canonical) = store.resolve(id) else {
                return Ok(None);
            };
            {
                let buffer = self.invalidations.lock();
                if buffer.contains(id) || buffer.contains(&canonical) {
                    return Ok(None);
                }
            }
            let Some(header) = store.header(&canonical) else {
                return Ok(None);
            };
            if header.is_expired_at(now) {
                let mut ids = vec![canonical.clone()];
                ids.extend(header.aliases.iter().cloned());
                (canonical, None, Some(ids), None)
            } else {
                let payload = store.read_payload(&canonical)?;
                let times = (header.expiration, header.validator_expiration);
                (canonical, payload, None, Some(times))
            }
        };

        if let Some(ids) = expired {
            debug!(cache = %self.name, id = %canonical, "expired disk record");
            self.enqueue(ids, BufferKind::Explicit)?;
            return Ok(None);
        }
        let Some(payload) = payload else {
            return Ok(None);
        };
        match self.codec.deserialize(&payload) {
            Ok(mut entry) => {
                // The header carries expirations rewritten after the payload
                if let Some((expiration, validator_expiration)) = times {
                    entry.expiration_time = expiration;
                    entry.validator_expiration_time = validator_expiration;
                }
                entry.loaded_from_disk = true;
                Ok(Some(entry))
            }
            Err(e) => {
                warn!(cache = %self.name, id = %canonical, error = %e, "undecodable disk record, discarding");
                self.enqueue(vec![canonical], BufferKind::Explicit)?;
                Ok(None)
            }
        }
    }

    /// Defer deletion of `id` (and the record it aliases)
    pub fn delete(&self, id: &str) -> Result<()> {
        let canonical = self.store.read().resolve(id);
        let mut ids = vec![id.to_string()];
        if let Some(canonical) = canonical.filter(|c| c != id) {
            ids.push(canonical);
        }
        self.enqueue(ids, BufferKind::Explicit)
    }

    /// Defer deletion of several ids
    pub fn delete_all<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Result<()> {
        self.enqueue(ids.into_iter().cloned().collect(), BufferKind::Explicit)
    }

    pub(crate) fn enqueue(&self, ids: Vec<String>, kind: BufferKind) -> Result<()> {
        let full = {
            let mut buffer = self.invalidations.lock();
            buffer.add_all(&ids, kind);
            buffer.is_full()
        };
        if full {
            debug!(cache = %self.name, "invalidation buffer full, draining");
            self.drain(true, false)?;
        }
        Ok(())
    }

    /// Rewrite expiration metadata of a record without touching its payload
    pub fn update_expiration_time(&self, id: &str, expiration: i64, validator_expiration: i64) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let mut store = self.store.write();
        if self.invalidations.lock().contains(id) {
            return Ok(false);
        }
        let Some((old, new)) = store.update_expiration(id, expiration, validator_expiration)? else {
            return Ok(false);
        };
        let mut heap = self.heap.lock();
        let hash = id_hash(&new.key);
        heap.find_and_remove(&new.key, old.expiration, hash, old.size);
        heap.insert(EvictionEntry::new(new.key.clone(), new.expiration, hash, new.size));
        Ok(true)
    }

    /// Point `alias` at the record for `id`
    pub fn add_alias(&self, id: &str, alias: &str) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let added = self.store.write().add_alias(id, alias)?;
        if added {
            self.invalidations.lock().remove(alias);
        }
        Ok(added)
    }

    pub fn remove_alias(&self, alias: &str) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.store.write().remove_alias(alias)
    }

    // =========================================================================
    // Tag Tables
    // =========================================================================

    /// Associate `id` with a tag on disk
    pub fn write_tag_entry(&self, kind: TagKind, tag: &str, id: &str) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::DiskUnavailable);
        }
        let mut store = self.store.write();
        match kind {
            TagKind::Dependency => store.dependencies.add(tag, id),
            TagKind::Template => store.templates.add(tag, id),
        }
    }

    pub fn remove_tag_entry(&self, kind: TagKind, tag: &str, id: &str) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let mut store = self.store.write();
        match kind {
            TagKind::Dependency => store.dependencies.remove(tag, id),
            TagKind::Template => store.templates.remove(tag, id),
        }
    }

    /// Members of a tag on disk, deleting the set if `delete` is set
    ///
    /// Ids pending deletion are left out.
    pub fn read_tag(&self, kind: TagKind, tag: &str, delete: bool) -> Result<IndexSet<String>> {
        if !self.is_enabled() {
            return Ok(IndexSet::new());
        }
        let mut ids = {
            let mut store = self.store.write();
            match kind {
                TagKind::Dependency => store.dependencies.read(tag, delete)?,
                TagKind::Template => store.templates.read(tag, delete)?,
            }
        };
        let buffer = self.invalidations.lock();
        ids.retain(|id| !buffer.contains(id));
        Ok(ids)
    }

    pub fn contains_tag(&self, kind: TagKind, tag: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let store = self.store.read();
        match kind {
            TagKind::Dependency => store.dependencies.contains_tag(tag),
            TagKind::Template => store.templates.contains_tag(tag),
        }
    }

    // =========================================================================
    // Whole-Tier Operations
    // =========================================================================

    /// Delete every record, tag set and pending invalidation
    pub fn clear(&self) -> Result<usize> {
        let mut store = self.store.write();
        let removed = store.len();
        store.clear()?;
        self.invalidations.lock().clear();
        self.heap.lock().clear();
        info!(cache = %self.name, removed, "disk tier cleared");
        Ok(removed)
    }

    /// Write buffered tag associations through to disk
    pub fn flush_tags(&self) -> Result<usize> {
        self.store.write().flush_tags()
    }
}
