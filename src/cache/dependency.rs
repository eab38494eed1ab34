//! Dependency Index
//!
//! In-memory map from a tag (dependency id or template) to the cache ids
//! grouped under it. The coordinator keeps one instance per tag kind and
//! guards both with its own lock.

use indexmap::IndexSet;
use std::collections::HashMap;

/// Tag to cache-id index
#[derive(Debug, Default)]
pub struct DependencyIndex {
    table: HashMap<String, IndexSet<String>>,
}

impl DependencyIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `id` with `tag`; returns false if already present
    pub fn add(&mut self, tag: &str, id: &str) -> bool {
        match self.table.get_mut(tag) {
            Some(ids) => ids.insert(id.to_string()),
            None => {
                let mut ids = IndexSet::new();
                ids.insert(id.to_string());
                self.table.insert(tag.to_string(), ids);
                true
            }
        }
    }

    /// Drop the association of `id` with `tag`; the tag goes away with its
    /// last id. Returns false when the association did not exist.
    pub fn remove_entry(&mut self, tag: &str, id: &str) -> bool {
        let Some(ids) = self.table.get_mut(tag) else {
            return false;
        };
        let removed = ids.shift_remove(id);
        if ids.is_empty() {
            self.table.remove(tag);
        }
        removed
    }

    /// Remove a tag and return every id that was grouped under it
    pub fn remove_dependency(&mut self, tag: &str) -> IndexSet<String> {
        self.table.remove(tag).unwrap_or_default()
    }

    /// Ids grouped under `tag`
    pub fn entries_for(&self, tag: &str) -> Option<&IndexSet<String>> {
        self.table.get(tag)
    }

    /// Whether `tag` has any ids
    pub fn contains_tag(&self, tag: &str) -> bool {
        self.table.contains_key(tag)
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no tags
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// All tags
    pub fn tags(&self) -> impl Iterator<Item = &String> {
        self.table.keys()
    }

    /// Re-add a set of ids under a tag (used to roll back a failed move)
    pub fn restore(&mut self, tag: &str, ids: IndexSet<String>) {
        if ids.is_empty() {
            return;
        }
        self.table.entry(tag.to_string()).or_default().extend(ids);
    }

    /// Remove every tag
    pub fn clear(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut index = DependencyIndex::new();
        assert!(index.add("product", "p1"));
        assert!(index.add("product", "p2"));
        assert!(!index.add("product", "p1"));

        let ids = index.entries_for("product").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("p1"));
        assert!(index.entries_for("missing").is_none());
    }

    #[test]
    fn test_remove_entry_drops_empty_tag() {
        let mut index = DependencyIndex::new();
        index.add("t", "a");
        assert!(index.remove_entry("t", "a"));
        assert!(!index.contains_tag("t"));
        assert!(!index.remove_entry("t", "a"));
        assert!(!index.remove_entry("nope", "a"));
    }

    #[test]
    fn test_remove_dependency_returns_members() {
        let mut index = DependencyIndex::new();
        index.add("t", "a");
        index.add("t", "b");
        let ids = index.remove_dependency("t");
        assert_eq!(ids.len(), 2);
        assert!(index.is_empty());
        assert!(index.remove_dependency("t").is_empty());
    }

    #[test]
    fn test_cache_id_as_tag() {
        let mut index = DependencyIndex::new();
        index.add("page/home", "fragment/header");
        index.add("fragment/header", "page/home");
        assert!(index.contains_tag("page/home"));
        assert!(index.contains_tag("fragment/header"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_restore() {
        let mut index = DependencyIndex::new();
        index.add("t", "a");
        let ids = index.remove_dependency("t");
        index.restore("t", ids);
        assert!(index.entries_for("t").unwrap().contains("a"));
    }
}
