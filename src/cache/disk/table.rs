//! Object Table
//!
//! File-per-record store for serialized entries. Records are sharded by id
//! hash into `{:02x}` subdirectories; each record is a payload file plus a
//! `.meta` JSON header written after it, so a header on disk always refers
//! to a complete payload. Alias records are header-only and point at the
//! canonical id.
//!
//! The index of headers is kept in memory and rebuilt from the `.meta`
//! files on open.

use crate::cache::entry::id_hash;
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metadata stored alongside each record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Id this record is stored under
    pub key: String,
    /// Canonical id when this is an alias record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    /// Absolute expiration (Unix millis, <= 0 for none)
    pub expiration: i64,
    /// Absolute validator expiration (Unix millis, <= 0 for none)
    pub validator_expiration: i64,
    /// Hash of the stored payload
    pub value_hash: u64,
    /// Accounted size in bytes
    pub size: u64,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub dependency_ids: Vec<String>,
    #[serde(default)]
    pub templates: Vec<String>,
}

impl RecordHeader {
    /// Header of an alias record
    pub fn alias(alias: &str, canonical: &str) -> Self {
        Self {
            key: alias.to_string(),
            alias_of: Some(canonical.to_string()),
            expiration: -1,
            validator_expiration: -1,
            value_hash: 0,
            size: 0,
            aliases: Vec::new(),
            dependency_ids: Vec::new(),
            templates: Vec::new(),
        }
    }

    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiration > 0 && self.expiration <= now
    }
}

#[derive(Debug, Clone)]
struct Record {
    path: PathBuf,
    header: RecordHeader,
}

/// On-disk map of id to record
#[derive(Debug)]
pub struct DiskTable {
    root: PathBuf,
    records: HashMap<String, Record>,
    occupied: HashMap<PathBuf, String>,
    objects: usize,
    sync_writes: bool,
}

impl DiskTable {
    /// Open a table rooted at `root`, rebuilding the index from disk
    pub fn open(root: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::disk_io("create object table", e))?;
        let mut table = Self {
            root,
            records: HashMap::new(),
            occupied: HashMap::new(),
            objects: 0,
            sync_writes,
        };
        table.rebuild_index()?;
        Ok(table)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        let shards = fs::read_dir(&self.root).map_err(|e| Error::disk_io("scan object table", e))?;
        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let Ok(files) = fs::read_dir(&shard_path) else {
                continue;
            };
            for file in files.flatten() {
                let meta_path = file.path();
                if meta_path.extension().map(|e| e != "meta").unwrap_or(true) {
                    continue;
                }
                let header = fs::read(&meta_path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<RecordHeader>(&raw).ok());
                let data_path = meta_path.with_extension("");
                match header {
                    Some(header) if header.is_alias() || data_path.exists() => {
                        if !header.is_alias() {
                            self.objects += 1;
                        }
                        self.occupied.insert(data_path.clone(), header.key.clone());
                        self.records.insert(
                            header.key.clone(),
                            Record {
                                path: data_path,
                                header,
                            },
                        );
                    }
                    _ => {
                        warn!(path = %meta_path.display(), "dropping unreadable record");
                        for path in [&meta_path, &data_path] {
                            if let Err(e) = remove_if_present(path) {
                                warn!(path = %path.display(), error = %e, "could not delete unreadable record");
                            }
                        }
                    }
                }
            }
        }
        debug!(
            root = %self.root.display(),
            objects = self.objects,
            aliases = self.records.len() - self.objects,
            "object table index rebuilt"
        );
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let hash = id_hash(key);
        let shard_dir = self.root.join(format!("{:02x}", hash & 0xff));
        let mut path = shard_dir.join(format!("{:016x}", hash));
        let mut suffix = 1;
        while self.occupied.get(&path).map(|owner| owner != key).unwrap_or(false) {
            path = shard_dir.join(format!("{:016x}-{}", hash, suffix));
            suffix += 1;
        }
        path
    }

    /// Number of object records, aliases excluded
    pub fn len(&self) -> usize {
        self.objects
    }

    pub fn is_empty(&self) -> bool {
        self.objects == 0
    }

    /// Whether any record (object or alias) exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn header(&self, key: &str) -> Option<&RecordHeader> {
        self.records.get(key).map(|r| &r.header)
    }

    /// Headers of every object record
    pub fn object_headers(&self) -> impl Iterator<Item = &RecordHeader> {
        self.records.values().map(|r| &r.header).filter(|h| !h.is_alias())
    }

    /// Follow an alias record to its canonical id
    pub fn resolve(&self, key: &str) -> Option<String> {
        let header = self.header(key)?;
        match &header.alias_of {
            Some(canonical) => self.records.contains_key(canonical).then(|| canonical.clone()),
            None => Some(key.to_string()),
        }
    }

    fn write_file(&self, path: &Path, bytes: &[u8], operation: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::disk_io(operation, e))?;
        }
        let mut file = fs::File::create(path).map_err(|e| Error::disk_io(operation, e))?;
        file.write_all(bytes).map_err(|e| Error::disk_io(operation, e))?;
        if self.sync_writes {
            file.sync_all().map_err(|e| Error::disk_io(operation, e))?;
        }
        Ok(())
    }

    /// Write or replace a record, returning the previous header
    pub fn put(&mut self, header: RecordHeader, payload: &[u8]) -> Result<Option<RecordHeader>> {
        let key = header.key.clone();
        let path = match self.records.get(&key) {
            Some(existing) => existing.path.clone(),
            None => self.path_for(&key),
        };
        if !header.is_alias() {
            self.write_file(&path, payload, "write object")?;
        }
        let meta = serde_json::to_vec(&header).map_err(|e| Error::Serialization(e.to_string()))?;
        self.write_file(&path.with_extension("meta"), &meta, "write object header")?;

        self.occupied.insert(path.clone(), key.clone());
        let is_alias = header.is_alias();
        let previous = self.records.insert(key, Record { path: path.clone(), header });
        let was_object = previous.as_ref().map(|r| !r.header.is_alias()).unwrap_or(false);
        if was_object && is_alias {
            remove_if_present(&path)?;
        }
        match (was_object, is_alias) {
            (false, false) => self.objects += 1,
            (true, true) => self.objects -= 1,
            _ => {}
        }
        Ok(previous.map(|r| r.header))
    }

    /// Write an alias record pointing at `canonical`
    pub fn put_alias(&mut self, alias: &str, canonical: &str) -> Result<()> {
        self.put(RecordHeader::alias(alias, canonical), &[]).map(|_| ())
    }

    /// Rewrite only the header of an existing record
    pub fn update_header(&mut self, key: &str, update: impl FnOnce(&mut RecordHeader)) -> Result<bool> {
        let Some(record) = self.records.get(key) else {
            return Ok(false);
        };
        let mut header = record.header.clone();
        let path = record.path.clone();
        update(&mut header);
        let meta = serde_json::to_vec(&header).map_err(|e| Error::Serialization(e.to_string()))?;
        self.write_file(&path.with_extension("meta"), &meta, "rewrite object header")?;
        if let Some(record) = self.records.get_mut(key) {
            record.header = header;
        }
        Ok(true)
    }

    /// Read the payload of an object record
    pub fn read_payload(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(record) = self.records.get(key) else {
            return Ok(None);
        };
        if record.header.is_alias() {
            return Ok(None);
        }
        match fs::read(&record.path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::disk_io("read object", e)),
        }
    }

    /// Physically delete a record
    ///
    /// The index is left untouched if the payload cannot be deleted. A
    /// header left behind without its payload is dropped at the next open.
    pub fn remove(&mut self, key: &str) -> Result<Option<RecordHeader>> {
        let Some(path) = self.records.get(key).map(|r| r.path.clone()) else {
            return Ok(None);
        };
        remove_if_present(&path)?;
        let Some(record) = self.records.remove(key) else {
            return Ok(None);
        };
        self.occupied.remove(&record.path);
        if !record.header.is_alias() {
            self.objects -= 1;
        }
        let meta_path = record.path.with_extension("meta");
        if let Err(e) = remove_if_present(&meta_path) {
            warn!(path = %meta_path.display(), error = %e, "orphaned record header");
        }
        Ok(Some(record.header))
    }

    /// Delete every record
    pub fn clear(&mut self) -> Result<()> {
        self.records.clear();
        self.occupied.clear();
        self.objects = 0;
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| Error::disk_io("clear object table", e))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::disk_io("clear object table", e))?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::disk_io("delete object", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(key: &str, size: u64) -> RecordHeader {
        RecordHeader {
            key: key.to_string(),
            alias_of: None,
            expiration: -1,
            validator_expiration: -1,
            value_hash: 7,
            size,
            aliases: Vec::new(),
            dependency_ids: vec!["dep".into()],
            templates: Vec::new(),
        }
    }

    #[test]
    fn test_put_read_remove() {
        let dir = TempDir::new().unwrap();
        let mut table = DiskTable::open(dir.path(), false).unwrap();

        assert!(table.put(header("a", 512), b"payload").unwrap().is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.read_payload("a").unwrap().unwrap().as_ref(), b"payload");

        let previous = table.put(header("a", 1024), b"payload2").unwrap();
        assert_eq!(previous.unwrap().size, 512);
        assert_eq!(table.len(), 1);

        let removed = table.remove("a").unwrap().unwrap();
        assert_eq!(removed.size, 1024);
        assert!(table.is_empty());
        assert!(table.read_payload("a").unwrap().is_none());
    }

    #[test]
    fn test_alias_records() {
        let dir = TempDir::new().unwrap();
        let mut table = DiskTable::open(dir.path(), false).unwrap();
        table.put(header("canonical", 512), b"v").unwrap();
        table.put_alias("alt", "canonical").unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("alt").as_deref(), Some("canonical"));
        assert!(table.read_payload("alt").unwrap().is_none());

        table.remove("canonical").unwrap();
        assert_eq!(table.resolve("alt"), None);
    }

    #[test]
    fn test_index_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut table = DiskTable::open(dir.path(), true).unwrap();
            table.put(header("a", 512), b"one").unwrap();
            table.put(header("b", 512), b"two").unwrap();
            table.put_alias("b2", "b").unwrap();
            table.update_header("a", |h| h.expiration = 99).unwrap();
        }
        let table = DiskTable::open(dir.path(), false).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.header("a").unwrap().expiration, 99);
        assert_eq!(table.resolve("b2").as_deref(), Some("b"));
        assert_eq!(table.read_payload("b").unwrap().unwrap().as_ref(), b"two");
    }

    fn meta_files(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for shard in std::fs::read_dir(root).unwrap().flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            for file in std::fs::read_dir(shard.path()).unwrap().flatten() {
                if file.path().extension().map(|e| e == "meta").unwrap_or(false) {
                    found.push(file.path());
                }
            }
        }
        found
    }

    #[test]
    fn test_unreadable_record_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut table = DiskTable::open(dir.path(), false).unwrap();
            table.put(header("a", 512), b"one").unwrap();
        }
        let metas = meta_files(dir.path());
        assert_eq!(metas.len(), 1);
        std::fs::write(&metas[0], b"not a header").unwrap();

        let table = DiskTable::open(dir.path(), false).unwrap();
        assert!(table.is_empty());
        assert!(!metas[0].exists());
        assert!(!metas[0].with_extension("").exists());
    }

    #[test]
    fn test_failed_payload_delete_keeps_index() {
        let dir = TempDir::new().unwrap();
        let mut table = DiskTable::open(dir.path(), false).unwrap();
        table.put(header("a", 512), b"one").unwrap();
        let data = meta_files(dir.path())[0].with_extension("");
        std::fs::remove_file(&data).unwrap();
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join("blocker"), b"x").unwrap();

        assert!(table.remove("a").is_err());
        assert_eq!(table.len(), 1);
        assert!(table.contains("a"));

        std::fs::remove_dir_all(&data).unwrap();
        assert_eq!(table.remove("a").unwrap().unwrap().size, 512);
        assert!(table.is_empty());
        assert!(meta_files(dir.path()).is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut table = DiskTable::open(dir.path(), false).unwrap();
        table.put(header("a", 512), b"one").unwrap();
        table.clear().unwrap();
        assert!(table.is_empty());
        assert!(!table.contains("a"));
    }
}
