//! Delay-Offload Buffer
//!
//! In-memory front for a value-set table. Associations for tags that do not
//! yet exist on disk are held here, so a hot new tag is not rewritten on
//! every add. A bucket is written through once it grows past the per-tag
//! limit; everything is written through on shutdown.

use crate::cache::disk::value_set::{AddOutcome, ValueSetStore};
use crate::error::Result;
use indexmap::{IndexMap, IndexSet};
use tracing::debug;

/// Bounded tag to id-set buffer
#[derive(Debug)]
pub struct DelayOffloadBuffer {
    entries_limit: usize,
    buckets_limit: usize,
    buckets: IndexMap<String, IndexSet<String>>,
}

impl DelayOffloadBuffer {
    pub fn new(entries_limit: usize, buckets_limit: usize) -> Self {
        Self {
            entries_limit,
            buckets_limit,
            buckets: IndexMap::new(),
        }
    }

    /// Record `id` under `tag`, buffering when the tag is new to disk
    pub fn add(&mut self, store: &mut dyn ValueSetStore, tag: &str, id: &str) -> Result<()> {
        if let Some(bucket) = self.buckets.get_mut(tag) {
            bucket.insert(id.to_string());
            if bucket.len() > self.entries_limit {
                self.flush_tag(store, tag)?;
            }
            return Ok(());
        }
        if store.add(tag, id, false)? == AddOutcome::TagMissing {
            if self.buckets.len() < self.buckets_limit {
                let mut bucket = IndexSet::new();
                bucket.insert(id.to_string());
                self.buckets.insert(tag.to_string(), bucket);
            } else {
                store.add(tag, id, true)?;
            }
        }
        Ok(())
    }

    /// Remove `id` from `tag` in the buffer and on disk
    pub fn remove(&mut self, store: &mut dyn ValueSetStore, tag: &str, id: &str) -> Result<bool> {
        let mut buffered = false;
        if let Some(bucket) = self.buckets.get_mut(tag) {
            buffered = bucket.shift_remove(id);
            if bucket.is_empty() {
                self.buckets.shift_remove(tag);
            }
        }
        let on_disk = store.remove(tag, id)?;
        Ok(buffered || on_disk)
    }

    /// Union of buffered and on-disk members
    pub fn read(&mut self, store: &mut dyn ValueSetStore, tag: &str, delete: bool) -> Result<IndexSet<String>> {
        let mut ids = if delete {
            self.buckets.shift_remove(tag).unwrap_or_default()
        } else {
            self.buckets.get(tag).cloned().unwrap_or_default()
        };
        ids.extend(store.read(tag, delete)?);
        Ok(ids)
    }

    /// Whether `tag` has buffered members
    pub fn contains_tag(&self, tag: &str) -> bool {
        self.buckets.contains_key(tag)
    }

    /// Buffered tags
    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.buckets.keys()
    }

    /// Write one bucket through, returning the number of ids written
    pub fn flush_tag(&mut self, store: &mut dyn ValueSetStore, tag: &str) -> Result<usize> {
        let Some(ids) = self.buckets.shift_remove(tag) else {
            return Ok(0);
        };
        if let Err(e) = store.add_all(tag, &ids) {
            self.buckets.insert(tag.to_string(), ids);
            return Err(e);
        }
        debug!(tag, ids = ids.len(), "flushed delay-offload bucket");
        Ok(ids.len())
    }

    /// Write every bucket through
    pub fn flush_all(&mut self, store: &mut dyn ValueSetStore) -> Result<usize> {
        let tags: Vec<String> = self.buckets.keys().cloned().collect();
        let mut written = 0;
        for tag in tags {
            written += self.flush_tag(store, &tag)?;
        }
        Ok(written)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buffered_ids(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::value_set::FileValueSetTable;
    use tempfile::TempDir;

    #[test]
    fn test_new_tag_is_buffered() {
        let dir = TempDir::new().unwrap();
        let mut store = FileValueSetTable::open(dir.path(), false).unwrap();
        let mut buffer = DelayOffloadBuffer::new(100, 100);

        buffer.add(&mut store, "tag", "a").unwrap();
        buffer.add(&mut store, "tag", "b").unwrap();
        assert!(buffer.contains_tag("tag"));
        assert!(!store.contains_tag("tag"));

        let ids = buffer.read(&mut store, "tag", false).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_bucket_flushed_past_limit() {
        let dir = TempDir::new().unwrap();
        let mut store = FileValueSetTable::open(dir.path(), false).unwrap();
        let mut buffer = DelayOffloadBuffer::new(2, 100);

        for id in ["a", "b", "c"] {
            buffer.add(&mut store, "tag", id).unwrap();
        }
        assert!(!buffer.contains_tag("tag"));
        assert_eq!(store.read("tag", false).unwrap().len(), 3);

        buffer.add(&mut store, "tag", "d").unwrap();
        assert!(!buffer.contains_tag("tag"));
        assert!(store.read("tag", false).unwrap().contains("d"));
    }

    #[test]
    fn test_bucket_limit_writes_through() {
        let dir = TempDir::new().unwrap();
        let mut store = FileValueSetTable::open(dir.path(), false).unwrap();
        let mut buffer = DelayOffloadBuffer::new(100, 1);

        buffer.add(&mut store, "first", "a").unwrap();
        buffer.add(&mut store, "second", "b").unwrap();
        assert_eq!(buffer.bucket_count(), 1);
        assert!(store.contains_tag("second"));
    }

    #[test]
    fn test_read_delete_and_flush_all() {
        let dir = TempDir::new().unwrap();
        let mut store = FileValueSetTable::open(dir.path(), false).unwrap();
        let mut buffer = DelayOffloadBuffer::new(100, 100);

        buffer.add(&mut store, "t1", "a").unwrap();
        buffer.add(&mut store, "t2", "b").unwrap();
        assert!(buffer.remove(&mut store, "t2", "b").unwrap());
        assert_eq!(buffer.flush_all(&mut store).unwrap(), 1);
        assert_eq!(buffer.buffered_ids(), 0);

        let ids = buffer.read(&mut store, "t1", true).unwrap();
        assert!(ids.contains("a"));
        assert!(!store.contains_tag("t1"));
    }
}
