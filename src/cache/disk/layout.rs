//! Disk Layout
//!
//! One directory per cache instance:
//!
//! ```text
//! <location>/<cache name>/
//! ├── object/          object table (sharded record files)
//! ├── dependency/      dependency-id value sets
//! ├── template/        template value sets
//! ├── properties.json  format version and size accounting
//! ├── last_scan        Unix millis of the last cleanup scan
//! └── in_progress      present while the instance is open
//! ```
//!
//! An `in_progress` marker found at startup means the previous process did
//! not stop cleanly, and every file is wiped before reinitialization.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// On-disk format version; any other version is wiped on open
pub const FORMAT_VERSION: u32 = 1;

const PROPERTIES_FILE: &str = "properties.json";
const LAST_SCAN_FILE: &str = "last_scan";
const IN_PROGRESS_FILE: &str = "in_progress";

/// Contents of the properties file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskProperties {
    pub version: u32,
    pub cache_name: String,
    pub entries: u64,
    pub bytes: u64,
    pub dependency_ids_disabled: bool,
    pub templates_disabled: bool,
    /// Unix millis when the file was written
    pub written_at: i64,
}

impl DiskProperties {
    pub fn new(cache_name: &str, entries: u64, bytes: u64, dependency_ids_disabled: bool, templates_disabled: bool) -> Self {
        Self {
            version: FORMAT_VERSION,
            cache_name: cache_name.to_string(),
            entries,
            bytes,
            dependency_ids_disabled,
            templates_disabled,
            written_at: Utc::now().timestamp_millis(),
        }
    }
}

/// How a previous layout was found at open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenState {
    /// Nothing on disk
    Fresh,
    /// A cleanly stopped instance
    Restored(DiskProperties),
    /// Files were discarded
    Wiped(WipeReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeReason {
    UncleanShutdown,
    VersionMismatch,
    CorruptProperties,
}

/// Paths of one cache instance's disk files
#[derive(Debug, Clone)]
pub struct DiskLayout {
    root: PathBuf,
}

impl DiskLayout {
    pub fn new(location: impl AsRef<Path>, cache_name: &str) -> Self {
        Self {
            root: location.as_ref().join(cache_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_dir(&self) -> PathBuf {
        self.root.join("object")
    }

    pub fn dependency_dir(&self) -> PathBuf {
        self.root.join("dependency")
    }

    pub fn template_dir(&self) -> PathBuf {
        self.root.join("template")
    }

    fn properties_path(&self) -> PathBuf {
        self.root.join(PROPERTIES_FILE)
    }

    fn last_scan_path(&self) -> PathBuf {
        self.root.join(LAST_SCAN_FILE)
    }

    fn in_progress_path(&self) -> PathBuf {
        self.root.join(IN_PROGRESS_FILE)
    }

    /// Inspect and, where needed, wipe a previous layout, then mark the
    /// instance as open
    pub fn open(&self) -> Result<OpenState> {
        fs::create_dir_all(&self.root).map_err(|e| Error::disk_io("create cache directory", e))?;

        let state = if self.in_progress_path().exists() {
            OpenState::Wiped(WipeReason::UncleanShutdown)
        } else {
            match self.read_properties() {
                Ok(Some(props)) if props.version == FORMAT_VERSION => OpenState::Restored(props),
                Ok(Some(props)) => {
                    warn!(found = props.version, expected = FORMAT_VERSION, "disk format version mismatch");
                    OpenState::Wiped(WipeReason::VersionMismatch)
                }
                Ok(None) => OpenState::Fresh,
                Err(e) => {
                    warn!(error = %e, "disk properties unreadable");
                    OpenState::Wiped(WipeReason::CorruptProperties)
                }
            }
        };

        match &state {
            OpenState::Wiped(reason) => {
                info!(root = %self.root.display(), reason = ?reason, "wiping disk cache files");
                self.wipe()?;
            }
            // Files without a properties record cannot be trusted
            OpenState::Fresh => self.wipe()?,
            OpenState::Restored(_) => {}
        }

        for dir in [self.object_dir(), self.dependency_dir(), self.template_dir()] {
            fs::create_dir_all(&dir).map_err(|e| Error::disk_io("create table directory", e))?;
        }
        fs::write(self.in_progress_path(), Utc::now().timestamp_millis().to_string())
            .map_err(|e| Error::disk_io("write in-progress marker", e))?;
        Ok(state)
    }

    /// Remove every file of this instance
    pub fn wipe(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| Error::disk_io("wipe cache directory", e))?;
        }
        fs::create_dir_all(&self.root).map_err(|e| Error::disk_io("create cache directory", e))?;
        Ok(())
    }

    pub fn read_properties(&self) -> Result<Option<DiskProperties>> {
        match fs::read(self.properties_path()) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::CorruptLayout(format!("properties: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::disk_io("read properties", e)),
        }
    }

    pub fn write_properties(&self, props: &DiskProperties) -> Result<()> {
        let raw = serde_json::to_vec_pretty(props)?;
        fs::write(self.properties_path(), raw).map_err(|e| Error::disk_io("write properties", e))
    }

    /// Time of the last cleanup scan in Unix millis
    pub fn read_last_scan(&self) -> Option<i64> {
        fs::read_to_string(self.last_scan_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_last_scan(&self, millis: i64) -> Result<()> {
        fs::write(self.last_scan_path(), millis.to_string()).map_err(|e| Error::disk_io("write last scan", e))
    }

    /// Mark a clean shutdown
    pub fn clear_in_progress(&self) -> Result<()> {
        match fs::remove_file(self.in_progress_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::disk_io("remove in-progress marker", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_then_restored() {
        let dir = TempDir::new().unwrap();
        let layout = DiskLayout::new(dir.path(), "baseCache");
        assert_matches!(layout.open().unwrap(), OpenState::Fresh);
        assert!(layout.object_dir().is_dir());

        layout.write_properties(&DiskProperties::new("baseCache", 3, 1536, false, false)).unwrap();
        layout.write_last_scan(42).unwrap();
        layout.clear_in_progress().unwrap();

        match layout.open().unwrap() {
            OpenState::Restored(props) => assert_eq!(props.entries, 3),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(layout.read_last_scan(), Some(42));
    }

    #[test]
    fn test_unclean_shutdown_wipes() {
        let dir = TempDir::new().unwrap();
        let layout = DiskLayout::new(dir.path(), "c");
        layout.open().unwrap();
        std::fs::write(layout.object_dir().join("stale"), b"x").unwrap();

        assert_matches!(layout.open().unwrap(), OpenState::Wiped(WipeReason::UncleanShutdown));
        assert!(!layout.object_dir().join("stale").exists());
    }

    #[test]
    fn test_version_mismatch_and_corrupt_wipe() {
        let dir = TempDir::new().unwrap();
        let layout = DiskLayout::new(dir.path(), "c");
        layout.open().unwrap();
        let mut props = DiskProperties::new("c", 0, 0, false, false);
        props.version = FORMAT_VERSION + 1;
        layout.write_properties(&props).unwrap();
        layout.clear_in_progress().unwrap();
        assert_matches!(layout.open().unwrap(), OpenState::Wiped(WipeReason::VersionMismatch));

        layout.clear_in_progress().unwrap();
        std::fs::write(dir.path().join("c").join("properties.json"), b"{not json").unwrap();
        assert_matches!(layout.open().unwrap(), OpenState::Wiped(WipeReason::CorruptProperties));
    }
}
