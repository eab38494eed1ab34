//! Value-Set Tables
//!
//! Disk-resident map of tag to set of cache ids, used for both the
//! dependency and template tables. A set is created by the first add for
//! its tag and its file is deleted when the last id leaves.

use crate::cache::entry::id_hash;
use crate::error::{Error, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of [`ValueSetStore::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The id joined an existing or newly created set
    Added,
    /// The id was already a member
    AlreadyPresent,
    /// The tag has no set and creation was not requested
    TagMissing,
}

/// Tag to id-set map with create-on-first-add and destroy-on-empty
pub trait ValueSetStore: Send + Sync {
    /// Add `id` under `tag`; a missing set is created only if `create` is set
    fn add(&mut self, tag: &str, id: &str, create: bool) -> Result<AddOutcome>;

    /// Add several ids under `tag`, creating the set if needed
    fn add_all(&mut self, tag: &str, ids: &IndexSet<String>) -> Result<()>;

    /// Remove `id` from `tag`; returns whether it was a member
    fn remove(&mut self, tag: &str, id: &str) -> Result<bool>;

    /// Members of `tag`, deleting the set if `delete` is set
    fn read(&mut self, tag: &str, delete: bool) -> Result<IndexSet<String>>;

    fn contains_tag(&self, tag: &str) -> bool;

    fn tags(&self) -> Vec<String>;

    /// Number of tags
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SetFile {
    tag: String,
    ids: IndexSet<String>,
}

#[derive(Debug)]
struct ValueSet {
    path: PathBuf,
    ids: IndexSet<String>,
}

/// One `<hash>.set` JSON file per tag
#[derive(Debug)]
pub struct FileValueSetTable {
    root: PathBuf,
    sets: HashMap<String, ValueSet>,
    occupied: HashSet<PathBuf>,
    sync_writes: bool,
}

impl FileValueSetTable {
    /// Open a table rooted at `root`, loading existing sets
    pub fn open(root: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::disk_io("create tag table", e))?;
        let mut sets = HashMap::new();
        let mut occupied = HashSet::new();
        let files = fs::read_dir(&root).map_err(|e| Error::disk_io("scan tag table", e))?;
        for file in files.flatten() {
            let path = file.path();
            if path.extension().map(|e| e != "set").unwrap_or(true) {
                continue;
            }
            match fs::read(&path).ok().and_then(|raw| serde_json::from_slice::<SetFile>(&raw).ok()) {
                Some(set) if !set.ids.is_empty() => {
                    occupied.insert(path.clone());
                    sets.insert(set.tag, ValueSet { path, ids: set.ids });
                }
                _ => {
                    warn!(path = %path.display(), "dropping unreadable tag set");
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "could not delete unreadable tag set");
                    }
                }
            }
        }
        debug!(root = %root.display(), tags = sets.len(), "tag table loaded");
        Ok(Self {
            root,
            sets,
            occupied,
            sync_writes,
        })
    }

    fn path_for(&self, tag: &str) -> PathBuf {
        let hash = id_hash(tag);
        let mut path = self.root.join(format!("{:016x}.set", hash));
        let mut suffix = 1;
        while self.occupied.contains(&path) {
            path = self.root.join(format!("{:016x}-{}.set", hash, suffix));
            suffix += 1;
        }
        path
    }

    fn persist(&self, tag: &str) -> Result<()> {
        let Some(set) = self.sets.get(tag) else {
            return Ok(());
        };
        let image = SetFile {
            tag: tag.to_string(),
            ids: set.ids.clone(),
        };
        let bytes = serde_json::to_vec(&image).map_err(|e| Error::Serialization(e.to_string()))?;
        write_file(&set.path, &bytes, self.sync_writes)
    }

    fn destroy(&mut self, tag: &str) -> Result<Option<ValueSet>> {
        let Some(set) = self.sets.remove(tag) else {
            return Ok(None);
        };
        self.occupied.remove(&set.path);
        match fs::remove_file(&set.path) {
            Ok(()) => Ok(Some(set)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Some(set)),
            Err(e) => Err(Error::disk_io("delete tag set", e)),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    use std::io::Write;
    let mut file = fs::File::create(path).map_err(|e| Error::disk_io("write tag set", e))?;
    file.write_all(bytes).map_err(|e| Error::disk_io("write tag set", e))?;
    if sync {
        file.sync_all().map_err(|e| Error::disk_io("write tag set", e))?;
    }
    Ok(())
}

impl ValueSetStore for FileValueSetTable {
    fn add(&mut self, tag: &str, id: &str, create: bool) -> Result<AddOutcome> {
        match self.sets.get_mut(tag) {
            Some(set) => {
                if !set.ids.insert(id.to_string()) {
                    return Ok(AddOutcome::AlreadyPresent);
                }
            }
            None if create => {
                let path = self.path_for(tag);
                self.occupied.insert(path.clone());
                let mut ids = IndexSet::new();
                ids.insert(id.to_string());
                self.sets.insert(tag.to_string(), ValueSet { path, ids });
            }
            None => return Ok(AddOutcome::TagMissing),
        }
        if let Err(e) = self.persist(tag) {
            let emptied = self
                .sets
                .get_mut(tag)
                .map(|set| {
                    set.ids.shift_remove(id);
                    set.ids.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                if let Some(set) = self.sets.remove(tag) {
                    self.occupied.remove(&set.path);
                }
            }
            return Err(e);
        }
        Ok(AddOutcome::Added)
    }

    fn add_all(&mut self, tag: &str, ids: &IndexSet<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if !self.sets.contains_key(tag) {
            let path = self.path_for(tag);
            self.occupied.insert(path.clone());
            self.sets.insert(
                tag.to_string(),
                ValueSet {
                    path,
                    ids: IndexSet::new(),
                },
            );
        }
        if let Some(set) = self.sets.get_mut(tag) {
            set.ids.extend(ids.iter().cloned());
        }
        self.persist(tag)
    }

    fn remove(&mut self, tag: &str, id: &str) -> Result<bool> {
        let Some(set) = self.sets.get_mut(tag) else {
            return Ok(false);
        };
        if !set.ids.shift_remove(id) {
            return Ok(false);
        }
        if set.ids.is_empty() {
            self.destroy(tag)?;
        } else {
            self.persist(tag)?;
        }
        Ok(true)
    }

    fn read(&mut self, tag: &str, delete: bool) -> Result<IndexSet<String>> {
        if delete {
            return Ok(self.destroy(tag)?.map(|set| set.ids).unwrap_or_default());
        }
        Ok(self.sets.get(tag).map(|set| set.ids.clone()).unwrap_or_default())
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.sets.contains_key(tag)
    }

    fn tags(&self) -> Vec<String> {
        self.sets.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.sets.len()
    }

    fn clear(&mut self) -> Result<()> {
        self.sets.clear();
        self.occupied.clear();
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| Error::disk_io("clear tag table", e))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::disk_io("clear tag table", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_on_first_add_destroy_on_empty() {
        let dir = TempDir::new().unwrap();
        let mut table = FileValueSetTable::open(dir.path(), false).unwrap();

        assert_eq!(table.add("tag", "a", false).unwrap(), AddOutcome::TagMissing);
        assert!(!table.contains_tag("tag"));

        assert_eq!(table.add("tag", "a", true).unwrap(), AddOutcome::Added);
        assert_eq!(table.add("tag", "b", false).unwrap(), AddOutcome::Added);
        assert_eq!(table.add("tag", "a", false).unwrap(), AddOutcome::AlreadyPresent);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        assert!(table.remove("tag", "a").unwrap());
        assert!(table.remove("tag", "b").unwrap());
        assert!(!table.contains_tag("tag"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_with_delete() {
        let dir = TempDir::new().unwrap();
        let mut table = FileValueSetTable::open(dir.path(), false).unwrap();
        let ids: IndexSet<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        table.add_all("product", &ids).unwrap();

        assert_eq!(table.read("product", false).unwrap().len(), 2);
        assert_eq!(table.read("product", true).unwrap(), ids);
        assert!(table.read("product", false).unwrap().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_sets_reloaded() {
        let dir = TempDir::new().unwrap();
        {
            let mut table = FileValueSetTable::open(dir.path(), false).unwrap();
            table.add("t1", "a", true).unwrap();
            table.add("t2", "b", true).unwrap();
        }
        let mut table = FileValueSetTable::open(dir.path(), false).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.read("t1", false).unwrap().contains("a"));
    }

    #[test]
    fn test_unreadable_set_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut table = FileValueSetTable::open(dir.path(), false).unwrap();
            table.add("good", "a", true).unwrap();
        }
        let broken = dir.path().join("broken.set");
        std::fs::write(&broken, b"{").unwrap();

        let table = FileValueSetTable::open(dir.path(), false).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_tag("good"));
        assert!(!broken.exists());
    }
}
