//! Tiered Object Cache
//!
//! An in-process object cache for a long-running server: a bounded memory
//! tier with priority-clock eviction, an optional persistent disk tier with
//! deferred invalidation, and group invalidation by dependency id or
//! template.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Tiered Cache                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Entry Pool    │  │ Dependency and  │  │      Priority Clock         │  │
//! │  │   + Id Index    │  │ Template Index  │  │      (LRU buckets)          │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │ spill / promote                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │      Disk Cache       │                                │
//! │                    │ hashed tables, buffer │                                │
//! │                    │ eviction heap         │                                │
//! │                    └───────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Memory tier coordinator, disk tier and supporting structures
//! - [`config`]: Cache and disk tier configuration
//! - [`error`]: Error types and disk write status codes

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheEvent, CacheListener, CacheStatsSnapshot,
    ChangeCause, InvalidationCause, SetOptions, SharingPolicy, Source,
    PutResult, TieredCache,
};

pub use config::{CacheConfig, DiskConfig, PerformanceLevel};

pub use error::{DiskWriteStatus, Error, Result, SizeLimit};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
