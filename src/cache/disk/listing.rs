//! Disk Listings
//!
//! Paged browsing of the object ids, dependency ids and templates held on
//! disk. Each listing keeps its own cursor, so a monitor can walk a large
//! tier page by page with [`RangeStep::Next`] and [`RangeStep::Previous`].
//! Pages are taken from the sorted listing at the time of the call; writes
//! between calls can shift entries across page boundaries.

use super::{DiskCache, TagKind};
use indexmap::IndexSet;
use serde::Serialize;

/// Direction of a paged listing call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RangeStep {
    /// First page
    Start,
    /// Page after the last one returned
    Next,
    /// Page before the last one returned
    Previous,
}

/// Which listing a cursor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Listing {
    Ids,
    Tags(TagKind),
}

/// Position of the last page handed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PageCursor {
    start: usize,
    shown: usize,
}

impl PageCursor {
    /// Slice the next page out of `all` and move the cursor onto it
    ///
    /// `length` of `None` returns everything from the computed start.
    fn advance(&mut self, all: Vec<String>, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        let length = length.unwrap_or(all.len());
        let start = match step {
            RangeStep::Start => 0,
            RangeStep::Next => self.start + self.shown,
            RangeStep::Previous => self.start.saturating_sub(length),
        }
        .min(all.len());
        let end = start.saturating_add(length).min(all.len());
        *self = Self {
            start,
            shown: end - start,
        };
        all.into_iter().skip(start).take(end - start).collect()
    }
}

impl DiskCache {
    /// Object ids on disk, pending deletes excluded, in sorted order
    pub fn ids(&self) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let store = self.store.read();
        let buffer = self.invalidations.lock();
        let mut ids: Vec<String> = store
            .object_headers()
            .filter(|h| !buffer.contains(&h.key))
            .map(|h| h.key.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Tags of one kind on disk, including delay-offload buckets
    pub fn tags(&self, kind: TagKind) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let store = self.store.read();
        match kind {
            TagKind::Dependency => store.dependencies.tags(),
            TagKind::Template => store.templates.tags(),
        }
    }

    pub fn ids_by_range(&self, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        let all = self.ids();
        self.page(Listing::Ids, all, step, length)
    }

    pub fn tags_by_range(&self, kind: TagKind, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        let all = self.tags(kind);
        self.page(Listing::Tags(kind), all, step, length)
    }

    fn page(&self, listing: Listing, all: Vec<String>, step: RangeStep, length: Option<usize>) -> IndexSet<String> {
        let mut cursors = self.cursors.lock();
        cursors.entry(listing).or_default().advance(all, step, length)
    }

    /// Ids waiting in the invalidation buffer
    pub fn pending_removal_size(&self) -> usize {
        self.pending_invalidations().total()
    }

    /// Tags of one kind held in the delay-offload buffer
    pub fn buffered_tag_count(&self, kind: TagKind) -> usize {
        let store = self.store.read();
        match kind {
            TagKind::Dependency => store.dependencies.buffered_tags(),
            TagKind::Template => store.templates.buffered_tags(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::tests::open_disk;
    use crate::cache::entry::CacheEntry;
    use crate::config::DiskConfig;
    use tempfile::TempDir;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{}", i)).collect()
    }

    fn set(ids: &[&str]) -> IndexSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cursor_pages_forward_and_back() {
        let mut cursor = PageCursor::default();
        assert_eq!(cursor.advance(names(5), RangeStep::Start, Some(2)), set(&["k0", "k1"]));
        assert_eq!(cursor.advance(names(5), RangeStep::Next, Some(2)), set(&["k2", "k3"]));
        assert_eq!(cursor.advance(names(5), RangeStep::Next, Some(2)), set(&["k4"]));
        assert!(cursor.advance(names(5), RangeStep::Next, Some(2)).is_empty());
        assert_eq!(cursor.advance(names(5), RangeStep::Previous, Some(2)), set(&["k3", "k4"]));
        assert_eq!(cursor.advance(names(5), RangeStep::Previous, Some(2)), set(&["k1", "k2"]));
        assert_eq!(cursor.advance(names(5), RangeStep::Previous, Some(2)), set(&["k0", "k1"]));
    }

    #[test]
    fn test_cursor_without_length_returns_rest() {
        let mut cursor = PageCursor::default();
        assert_eq!(cursor.advance(names(3), RangeStep::Start, None).len(), 3);
        assert!(cursor.advance(names(3), RangeStep::Next, None).is_empty());
    }

    #[tokio::test]
    async fn test_disk_listings() {
        let dir = TempDir::new().unwrap();
        let disk = open_disk(&dir, DiskConfig::default());
        assert!(disk.config().delay_offload());
        for id in ["c", "a", "b"] {
            disk.write_with_tags(&CacheEntry::new(id, "v").with_dependency(format!("dep-{}", id)).with_template("/t"))
                .unwrap();
        }
        disk.delete("b").unwrap();

        assert_eq!(disk.ids(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(disk.pending_removal_size(), 1);
        assert_eq!(disk.ids_by_range(RangeStep::Start, Some(1)), set(&["a"]));
        assert_eq!(disk.ids_by_range(RangeStep::Next, Some(1)), set(&["c"]));

        assert_eq!(disk.tags(TagKind::Template), vec!["/t".to_string()]);
        assert_eq!(disk.buffered_tag_count(TagKind::Dependency), 3);
        assert_eq!(
            disk.tags_by_range(TagKind::Dependency, RangeStep::Start, None),
            set(&["dep-a", "dep-b", "dep-c"])
        );

        disk.flush_tags().unwrap();
        assert_eq!(disk.buffered_tag_count(TagKind::Dependency), 0);
        assert_eq!(disk.tags(TagKind::Dependency).len(), 3);
    }
}
