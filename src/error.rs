//! Error types for the tiered object cache
//!
//! Provides structured error types for the memory tier coordinator and the
//! disk tier (object store, tag tables, invalidation buffer, eviction heap).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),

    // =========================================================================
    // Disk Tier Errors
    // =========================================================================
    #[error("Disk I/O failed during {operation}: {source}")]
    DiskIo {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Disk tier unavailable")]
    DiskUnavailable,

    #[error("Disk size limit exceeded ({limit}): requested {requested}, allowed {allowed}")]
    SizeLimitExceeded {
        limit: SizeLimit,
        requested: u64,
        allowed: u64,
    },

    #[error("Disk layout corrupt: {0}")]
    CorruptLayout(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which disk limit an over-limit write tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeLimit {
    /// Number of records in the object table
    Entries,
    /// Total bytes of the object table
    Bytes,
    /// Size of a single record
    EntrySize,
}

impl fmt::Display for SizeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeLimit::Entries => write!(f, "entries"),
            SizeLimit::Bytes => write!(f, "bytes"),
            SizeLimit::EntrySize => write!(f, "entry size"),
        }
    }
}

/// Outcome code of a disk write, as surfaced to statistics and to
/// direct-to-disk callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskWriteStatus {
    NoException,
    DiskException,
    DiskSizeOverLimit,
    Other,
    Serialization,
    DiskSizeInEntriesOverLimit,
    DiskCacheEntrySizeOverLimit,
    NoExceptionEntryOverwritten,
}

impl DiskWriteStatus {
    /// Numeric status code
    pub fn code(&self) -> u8 {
        match self {
            DiskWriteStatus::NoException => 0,
            DiskWriteStatus::DiskException => 1,
            DiskWriteStatus::DiskSizeOverLimit => 2,
            DiskWriteStatus::Other => 3,
            DiskWriteStatus::Serialization => 4,
            DiskWriteStatus::DiskSizeInEntriesOverLimit => 5,
            DiskWriteStatus::DiskCacheEntrySizeOverLimit => 6,
            DiskWriteStatus::NoExceptionEntryOverwritten => 7,
        }
    }

    /// Whether the write reached disk
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DiskWriteStatus::NoException | DiskWriteStatus::NoExceptionEntryOverwritten
        )
    }
}

impl Error {
    /// Wrap an I/O error raised by a disk tier operation
    pub fn disk_io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Error::DiskIo {
            operation: operation.into(),
            source,
        }
    }

    /// Map this error onto a disk write status code
    pub fn disk_status(&self) -> DiskWriteStatus {
        match self {
            Error::DiskIo { .. } | Error::Io(_) | Error::DiskUnavailable | Error::CorruptLayout(_) => {
                DiskWriteStatus::DiskException
            }
            Error::SizeLimitExceeded { limit, .. } => match limit {
                SizeLimit::Entries => DiskWriteStatus::DiskSizeInEntriesOverLimit,
                SizeLimit::Bytes => DiskWriteStatus::DiskSizeOverLimit,
                SizeLimit::EntrySize => DiskWriteStatus::DiskCacheEntrySizeOverLimit,
            },
            Error::Serialization(_) | Error::Json(_) => DiskWriteStatus::Serialization,
            _ => DiskWriteStatus::Other,
        }
    }

    /// Check if this error must disable the disk tier
    pub fn is_disk_fatal(&self) -> bool {
        matches!(
            self,
            Error::DiskIo { .. } | Error::Io(_) | Error::CorruptLayout(_)
        )
    }

    /// Check if this error is a size-limit breach
    pub fn is_size_limit(&self) -> bool {
        matches!(self, Error::SizeLimitExceeded { .. })
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_disk_status_codes() {
        let err = Error::SizeLimitExceeded {
            limit: SizeLimit::EntrySize,
            requested: 4096,
            allowed: 1024,
        };
        assert_eq!(err.disk_status(), DiskWriteStatus::DiskCacheEntrySizeOverLimit);
        assert_eq!(err.disk_status().code(), 6);
        assert!(err.is_size_limit());
        assert!(!err.is_disk_fatal());

        let err = Error::Serialization("bad value".into());
        assert_eq!(err.disk_status().code(), 4);

        let err = Error::Internal("boom".into());
        assert_eq!(err.disk_status(), DiskWriteStatus::Other);
    }

    #[test]
    fn test_disk_fatal() {
        let err = Error::disk_io(
            "write object",
            std::io::Error::new(std::io::ErrorKind::Other, "device gone"),
        );
        assert!(err.is_disk_fatal());
        assert_matches!(err.disk_status(), DiskWriteStatus::DiskException);
        assert!(err.to_string().contains("write object"));
    }

    #[test]
    fn test_status_success() {
        assert!(DiskWriteStatus::NoException.is_success());
        assert!(DiskWriteStatus::NoExceptionEntryOverwritten.is_success());
        assert!(!DiskWriteStatus::DiskSizeOverLimit.is_success());
        assert_eq!(DiskWriteStatus::NoExceptionEntryOverwritten.code(), 7);
    }
}
