//! Disk Hash Store
//!
//! The object table and the two tag tables, plus size accounting. The
//! whole store sits behind one reader-writer lock owned by
//! [`DiskCache`](super::DiskCache); every method here assumes the caller
//! holds the matching side of that lock.

use crate::cache::disk::delay_offload::DelayOffloadBuffer;
use crate::cache::disk::layout::DiskLayout;
use crate::cache::disk::table::{DiskTable, RecordHeader};
use crate::cache::disk::value_set::{FileValueSetTable, ValueSetStore};
use crate::config::DiskConfig;
use crate::error::{Error, Result, SizeLimit};
use bytes::Bytes;
use indexmap::IndexSet;
use std::path::PathBuf;

/// Fixed per-record accounting overhead in bytes
pub const RECORD_OVERHEAD: u64 = 256;

/// Accounting granularity in bytes
pub const BLOCK_SIZE: u64 = 512;

/// Accounted size of a record: overhead, id and payload rounded up to
/// whole blocks
pub fn record_size(id: &str, payload_len: usize) -> u64 {
    let raw = RECORD_OVERHEAD + id.len() as u64 + payload_len as u64;
    raw.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

// =============================================================================
// Tag Table
// =============================================================================

/// Dependency or template table with its optional delay-offload front
pub struct TagTable {
    sets: Box<dyn ValueSetStore>,
    offload: Option<DelayOffloadBuffer>,
    disabled: bool,
}

impl std::fmt::Debug for TagTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagTable")
            .field("tags", &self.sets.len())
            .field("offload", &self.offload)
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl TagTable {
    pub fn new(sets: Box<dyn ValueSetStore>, offload: Option<DelayOffloadBuffer>, disabled: bool) -> Self {
        Self {
            sets,
            offload,
            disabled,
        }
    }

    fn open(dir: PathBuf, config: &DiskConfig, buckets: usize, disabled: bool) -> Result<Self> {
        let sets = FileValueSetTable::open(dir, config.sync_writes)?;
        let offload = config
            .delay_offload()
            .then(|| DelayOffloadBuffer::new(config.delay_offload_entries_limit, buckets));
        Ok(Self::new(Box::new(sets), offload, disabled))
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Tags stored on disk, buffered tags excluded
    pub fn persisted_tags(&self) -> usize {
        self.sets.len()
    }

    /// Tags held in the delay-offload buffer
    pub fn buffered_tags(&self) -> usize {
        self.offload.as_ref().map(|b| b.bucket_count()).unwrap_or(0)
    }

    /// Every tag, persisted or buffered, in sorted order
    pub fn tags(&self) -> Vec<String> {
        let mut tags: IndexSet<String> = self.sets.tags().into_iter().collect();
        if let Some(buffer) = &self.offload {
            tags.extend(buffer.tags().cloned());
        }
        let mut tags: Vec<String> = tags.into_iter().collect();
        tags.sort_unstable();
        tags
    }

    pub fn add(&mut self, tag: &str, id: &str) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        match &mut self.offload {
            Some(buffer) => buffer.add(self.sets.as_mut(), tag, id),
            None => self.sets.add(tag, id, true).map(|_| ()),
        }
    }

    pub fn remove(&mut self, tag: &str, id: &str) -> Result<bool> {
        if self.disabled {
            return Ok(false);
        }
        match &mut self.offload {
            Some(buffer) => buffer.remove(self.sets.as_mut(), tag, id),
            None => self.sets.remove(tag, id),
        }
    }

    pub fn read(&mut self, tag: &str, delete: bool) -> Result<IndexSet<String>> {
        if self.disabled {
            return Ok(IndexSet::new());
        }
        match &mut self.offload {
            Some(buffer) => buffer.read(self.sets.as_mut(), tag, delete),
            None => self.sets.read(tag, delete),
        }
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.sets.contains_tag(tag) || self.offload.as_ref().map(|b| b.contains_tag(tag)).unwrap_or(false)
    }

    /// Write buffered associations through to disk
    pub fn flush(&mut self) -> Result<usize> {
        match &mut self.offload {
            Some(buffer) => buffer.flush_all(self.sets.as_mut()),
            None => Ok(0),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        if let Some(buffer) = &mut self.offload {
            buffer.clear();
        }
        self.sets.clear()
    }
}

// =============================================================================
// Disk Store
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct StoreLimits {
    entries: u64,
    bytes: u64,
    entry_size: u64,
}

/// Object table, tag tables and accounting
#[derive(Debug)]
pub struct DiskStore {
    objects: DiskTable,
    pub(crate) dependencies: TagTable,
    pub(crate) templates: TagTable,
    bytes: u64,
    limits: StoreLimits,
}

impl DiskStore {
    /// Open the tables of `layout`
    ///
    /// Tag tables that were disabled by configuration are kept enabled when
    /// the previous run persisted sets for them.
    pub fn open(layout: &DiskLayout, config: &DiskConfig) -> Result<Self> {
        let objects = DiskTable::open(layout.object_dir(), config.sync_writes)?;
        let dependencies = TagTable::open(
            layout.dependency_dir(),
            config,
            config.delay_offload_dependency_buckets,
            config.disable_dependency_ids,
        )?;
        let templates = TagTable::open(
            layout.template_dir(),
            config,
            config.delay_offload_template_buckets,
            config.disable_templates,
        )?;
        let bytes = objects.object_headers().map(|h| h.size).sum();
        Ok(Self {
            objects,
            dependencies,
            templates,
            bytes,
            limits: StoreLimits {
                entries: config.size_limit_entries,
                bytes: config.size_limit_bytes(),
                entry_size: config.entry_size_limit_bytes(),
            },
        })
    }

    /// Re-enable a tag table that still holds persisted sets
    pub(crate) fn enable_persisted_tag_tables(&mut self) -> (bool, bool) {
        let deps = self.dependencies.disabled && self.dependencies.persisted_tags() > 0;
        let templates = self.templates.disabled && self.templates.persisted_tags() > 0;
        if deps {
            self.dependencies.disabled = false;
        }
        if templates {
            self.templates.disabled = false;
        }
        (deps, templates)
    }

    /// Number of object records
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Accounted bytes of all object records
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn entry_limit(&self) -> u64 {
        self.limits.entries
    }

    pub fn byte_limit(&self) -> u64 {
        self.limits.bytes
    }

    pub fn header(&self, id: &str) -> Option<&RecordHeader> {
        self.objects.header(id)
    }

    pub fn object_headers(&self) -> impl Iterator<Item = &RecordHeader> {
        self.objects.object_headers()
    }

    /// Canonical id for `id`, following alias records
    pub fn resolve(&self, id: &str) -> Option<String> {
        self.objects.resolve(id)
    }

    /// Reject a write of `size` bytes under `id` that would breach a limit
    pub fn check_limits(&self, id: &str, size: u64) -> Result<()> {
        let limits = self.limits;
        if limits.entry_size > 0 && size >= limits.entry_size {
            return Err(Error::SizeLimitExceeded {
                limit: SizeLimit::EntrySize,
                requested: size,
                allowed: limits.entry_size,
            });
        }
        let existing = self.objects.header(id).filter(|h| !h.is_alias()).map(|h| h.size);
        if limits.entries > 0 && existing.is_none() && self.objects.len() as u64 >= limits.entries {
            return Err(Error::SizeLimitExceeded {
                limit: SizeLimit::Entries,
                requested: self.objects.len() as u64 + 1,
                allowed: limits.entries,
            });
        }
        let projected = self.bytes.saturating_sub(existing.unwrap_or(0)) + size;
        if limits.bytes > 0 && projected >= limits.bytes {
            return Err(Error::SizeLimitExceeded {
                limit: SizeLimit::Bytes,
                requested: projected,
                allowed: limits.bytes,
            });
        }
        Ok(())
    }

    /// Write an object record and its alias records
    ///
    /// Limits are checked first; nothing is written on a breach. Returns
    /// the header the record replaced, if any.
    pub fn put_record(&mut self, header: RecordHeader, payload: &[u8]) -> Result<Option<RecordHeader>> {
        self.check_limits(&header.key, header.size)?;
        let id = header.key.clone();
        let aliases = header.aliases.clone();
        let size = header.size;

        let previous = self.objects.put(header, payload)?;
        let previous = previous.filter(|p| !p.is_alias());
        self.bytes = self.bytes.saturating_sub(previous.as_ref().map(|p| p.size).unwrap_or(0)) + size;

        if let Some(previous) = &previous {
            for stale in previous.aliases.iter().filter(|a| !aliases.contains(a)) {
                self.remove_alias_record(stale, &id)?;
            }
        }
        for alias in &aliases {
            self.objects.put_alias(alias, &id)?;
        }
        Ok(previous)
    }

    /// Payload of the object record for `id` (aliases not followed)
    pub fn read_payload(&self, id: &str) -> Result<Option<Bytes>> {
        self.objects.read_payload(id)
    }

    fn remove_alias_record(&mut self, alias: &str, canonical: &str) -> Result<()> {
        let points_here = self
            .objects
            .header(alias)
            .and_then(|h| h.alias_of.as_deref())
            .map(|target| target == canonical)
            .unwrap_or(false);
        if points_here {
            self.objects.remove(alias)?;
        }
        Ok(())
    }

    /// Physically delete a record with its alias records and tag memberships
    pub fn remove_record(&mut self, id: &str) -> Result<Option<RecordHeader>> {
        let Some(canonical) = self.objects.resolve(id) else {
            if self.objects.header(id).map(|h| h.is_alias()).unwrap_or(false) {
                self.objects.remove(id)?;
            }
            return Ok(None);
        };
        let Some(header) = self.objects.remove(&canonical)? else {
            return Ok(None);
        };
        self.bytes = self.bytes.saturating_sub(header.size);
        for alias in &header.aliases {
            self.remove_alias_record(alias, &canonical)?;
        }
        for tag in &header.dependency_ids {
            self.dependencies.remove(tag, &canonical)?;
        }
        for template in &header.templates {
            self.templates.remove(template, &canonical)?;
        }
        Ok(Some(header))
    }

    /// Point `alias` at the record for `id`
    pub fn add_alias(&mut self, id: &str, alias: &str) -> Result<bool> {
        let Some(canonical) = self.objects.resolve(id) else {
            return Ok(false);
        };
        if self.objects.header(alias).map(|h| !h.is_alias()).unwrap_or(false) {
            return Ok(false);
        }
        self.objects.put_alias(alias, &canonical)?;
        let alias_owned = alias.to_string();
        self.objects.update_header(&canonical, |h| {
            if !h.aliases.contains(&alias_owned) {
                h.aliases.push(alias_owned);
            }
        })?;
        Ok(true)
    }

    /// Remove an alias record and drop it from its canonical header
    pub fn remove_alias(&mut self, alias: &str) -> Result<bool> {
        let Some(canonical) = self.objects.header(alias).and_then(|h| h.alias_of.clone()) else {
            return Ok(false);
        };
        self.objects.remove(alias)?;
        self.objects.update_header(&canonical, |h| h.aliases.retain(|a| a != alias))?;
        Ok(true)
    }

    /// Rewrite expiration metadata; returns old and new headers
    pub fn update_expiration(
        &mut self,
        id: &str,
        expiration: i64,
        validator_expiration: i64,
    ) -> Result<Option<(RecordHeader, RecordHeader)>> {
        let Some(canonical) = self.objects.resolve(id) else {
            return Ok(None);
        };
        let Some(old) = self.objects.header(&canonical).cloned() else {
            return Ok(None);
        };
        if old.expiration == expiration && old.validator_expiration == validator_expiration {
            return Ok(Some((old.clone(), old)));
        }
        self.objects.update_header(&canonical, |h| {
            h.expiration = expiration;
            h.validator_expiration = validator_expiration;
        })?;
        Ok(self.objects.header(&canonical).cloned().map(|new| (old, new)))
    }

    /// Ids of object records expired at `now`
    pub fn expired_ids(&self, now: i64) -> Vec<String> {
        self.objects
            .object_headers()
            .filter(|h| h.is_expired_at(now))
            .map(|h| h.key.clone())
            .collect()
    }

    /// Write buffered tag associations through
    pub fn flush_tags(&mut self) -> Result<usize> {
        Ok(self.dependencies.flush()? + self.templates.flush()?)
    }

    /// Delete every record and tag set
    pub fn clear(&mut self) -> Result<()> {
        self.objects.clear()?;
        self.dependencies.clear()?;
        self.templates.clear()?;
        self.bytes = 0;
        Ok(())
    }
}
