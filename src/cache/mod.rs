//! Tiered Object Cache
//!
//! A bounded in-memory cache of identified entries with an optional
//! persistent disk tier and optional peer replication:
//! - **Memory**: fixed-capacity entry pool indexed by id and alias, evicted
//!   by a priority clock
//! - **Disk**: hashed object, dependency and template tables with deferred
//!   deletion through an invalidation buffer
//! - **Remote**: advisory pull on miss and push on write
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Tiered Cache                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌────────────┐   │
//! │  │ Entry Pool   │  │ Id / Alias   │  │ Dependency & │  │ Priority   │   │
//! │  │ (slots)      │  │ Index        │  │ Template Idx │  │ Clock      │   │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └────────────┘   │
//! │                  one lock; events dispatched after release                 │
//! ├───────────────────────────────┬─────────────────────────────────────────┤
//! │          spill / promote      │           pull / push                   │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────┐   ┌──────────────────────┐    │
//! │  │             Disk Cache               │   │   Remote Services    │    │
//! │  │  object │ dependency │ template      │   │   (peer caches)      │    │
//! │  │  delay-offload buffer                │   └──────────────────────┘    │
//! │  │  invalidation buffer (explicit,      │                               │
//! │  │     scan, garbage collector)         │                               │
//! │  │  eviction heap                       │                               │
//! │  └──────────────────────────────────────┘                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tiered_object_cache::cache::{CacheEntry, TieredCache};
//! use tiered_object_cache::config::CacheConfig;
//!
//! let cache = TieredCache::new(CacheConfig::named("pages"))?;
//! cache.start();
//!
//! cache.put(CacheEntry::new("/home", "<html>").with_dependency("user:42"))?;
//! assert!(cache.get("/home").is_some());
//!
//! // Drops every entry that depends on user:42, in memory and on disk
//! cache.invalidate("user:42");
//!
//! cache.stop().await?;
//! ```

pub mod compression;
pub mod dependency;
pub mod disk;
pub mod entry;
pub mod events;
pub mod expiration;
pub mod lifecycle;
pub mod lru;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod remote;
pub mod scheduler;

// Re-export main types
pub use compression::CompressionAlgorithm;
pub use dependency::DependencyIndex;
pub use disk::{DiskCache, DiskEvictionPolicy, EntryCodec, JsonEntryCodec, RangeStep, TagKind};
pub use entry::{now_millis, CacheEntry, EntryState, SharingPolicy, NO_EXPIRATION};
pub use events::{CacheEvent, CacheListener, ChangeCause, InvalidationCause, Source};
pub use expiration::ExpirationSchedule;
pub use lru::PriorityClock;
pub use manager::{ContentDirective, PutResult, SetOptions, TieredCache};
pub use metrics::{CacheMetrics, CacheStatsSnapshot, Tier, TierMetricsSnapshot};
pub use pool::{EntryHandle, EntryPool};
pub use remote::{NoopRemoteServices, RemoteServices};
pub use scheduler::{Scheduler, TokioScheduler};
