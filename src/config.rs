//! Cache Configuration
//!
//! Memory tier and disk tier settings. Loaded from YAML or built in code;
//! out-of-range values are clamped by [`CacheConfig::validate`] with a
//! warning instead of failing startup.

use crate::cache::compression::CompressionAlgorithm;
use crate::cache::disk::eviction::DiskEvictionPolicy;
use crate::cache::entry::SharingPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

// =============================================================================
// Limits
// =============================================================================

/// Largest cleanup interval in minutes (one day)
pub const MAX_CLEANUP_FREQUENCY_MINS: u32 = 24 * 60;

/// Default high watermark, percent of a disk limit
pub const DEFAULT_HIGH_THRESHOLD: u8 = 80;

/// Default low watermark, percent of a disk limit
pub const DEFAULT_LOW_THRESHOLD: u8 = 70;

/// Smallest per-tag entry limit accepted for the delay-offload buffer
pub const MIN_DELAY_OFFLOAD_ENTRIES: usize = 100;

/// Smallest bucket limit accepted for the delay-offload buffer
pub const MIN_DELAY_OFFLOAD_BUCKETS: usize = 100;

const DEFAULT_DELAY_OFFLOAD_ENTRIES: usize = 1000;
const DEFAULT_DELAY_OFFLOAD_DEPENDENCY_BUCKETS: usize = 10_000;
const DEFAULT_DELAY_OFFLOAD_TEMPLATE_BUCKETS: usize = 100;

// =============================================================================
// Performance Level
// =============================================================================

/// Disk tier performance profile, controls the delay-offload buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    /// Every tag association is written through to disk
    Low,
    /// Delay offload with default buffer limits
    #[default]
    Balanced,
    /// Delay offload with unbounded buffers
    High,
    /// Delay offload with configured buffer limits
    Custom,
}

// =============================================================================
// Disk Configuration
// =============================================================================

/// Configuration for the disk tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Whether LRU victims spill to disk
    pub enabled: bool,
    /// Root directory; each cache instance gets a subdirectory
    pub location: PathBuf,
    /// Maximum number of records (0 = unlimited)
    pub size_limit_entries: u64,
    /// Maximum total size in GB (0 = unlimited)
    pub size_limit_gb: u64,
    /// Maximum size of a single record in MB (0 = unlimited)
    pub entry_size_limit_mb: u64,
    /// Percent of a limit at which garbage collection starts
    pub high_threshold: u8,
    /// Percent of a limit garbage collection trims down to
    pub low_threshold: u8,
    /// Policy used when expired records do not free enough space
    pub eviction_policy: DiskEvictionPolicy,
    /// Delay-offload profile
    pub performance_level: PerformanceLevel,
    /// Max ids buffered per tag before the tag is flushed
    pub delay_offload_entries_limit: usize,
    /// Max dependency tags held in the buffer
    pub delay_offload_dependency_buckets: usize,
    /// Max templates held in the buffer
    pub delay_offload_template_buckets: usize,
    /// Capacity of the invalidation buffer before a forced drain
    pub invalidation_buffer_size: usize,
    /// Minutes between cleanup passes (0 = daily at `cleanup_hour`)
    pub cleanup_frequency_mins: u32,
    /// Hour of day (UTC) for the daily cleanup pass
    pub cleanup_hour: u8,
    /// Spill evictable memory entries on stop
    pub flush_to_disk_on_stop: bool,
    /// Above this many pending explicit invalidations, stop clears the disk
    pub explicit_buffer_limit_on_stop: usize,
    /// Skip dependency-id tables
    pub disable_dependency_ids: bool,
    /// Skip template tables
    pub disable_templates: bool,
    /// Compression applied to record payloads
    pub compression: CompressionAlgorithm,
    /// Whether to fsync record files
    pub sync_writes: bool,
    /// Seconds stop waits for an in-flight cleanup pass
    pub shutdown_wait_secs: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            location: std::env::temp_dir().join("tiered-object-cache"),
            size_limit_entries: 0,
            size_limit_gb: 0,
            entry_size_limit_mb: 0,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            low_threshold: DEFAULT_LOW_THRESHOLD,
            eviction_policy: DiskEvictionPolicy::Random,
            performance_level: PerformanceLevel::Balanced,
            delay_offload_entries_limit: DEFAULT_DELAY_OFFLOAD_ENTRIES,
            delay_offload_dependency_buckets: DEFAULT_DELAY_OFFLOAD_DEPENDENCY_BUCKETS,
            delay_offload_template_buckets: DEFAULT_DELAY_OFFLOAD_TEMPLATE_BUCKETS,
            invalidation_buffer_size: 1000,
            cleanup_frequency_mins: 0,
            cleanup_hour: 0,
            flush_to_disk_on_stop: false,
            explicit_buffer_limit_on_stop: 0,
            disable_dependency_ids: false,
            disable_templates: false,
            compression: CompressionAlgorithm::None,
            sync_writes: false,
            shutdown_wait_secs: 5,
        }
    }
}

impl DiskConfig {
    /// Whether tag writes go through the delay-offload buffer
    pub fn delay_offload(&self) -> bool {
        !matches!(self.performance_level, PerformanceLevel::Low)
    }

    /// Byte limit derived from `size_limit_gb` (0 = unlimited)
    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_gb.saturating_mul(1024 * 1024 * 1024)
    }

    /// Per-record byte limit derived from `entry_size_limit_mb` (0 = unlimited)
    pub fn entry_size_limit_bytes(&self) -> u64 {
        self.entry_size_limit_mb.saturating_mul(1024 * 1024)
    }

    fn validate(&mut self, cache_name: &str) {
        match self.performance_level {
            PerformanceLevel::Low => {}
            PerformanceLevel::Balanced => {
                self.delay_offload_entries_limit = DEFAULT_DELAY_OFFLOAD_ENTRIES;
                self.delay_offload_dependency_buckets = DEFAULT_DELAY_OFFLOAD_DEPENDENCY_BUCKETS;
                self.delay_offload_template_buckets = DEFAULT_DELAY_OFFLOAD_TEMPLATE_BUCKETS;
            }
            PerformanceLevel::High => {
                self.delay_offload_entries_limit = usize::MAX;
                self.delay_offload_dependency_buckets = usize::MAX;
                self.delay_offload_template_buckets = usize::MAX;
            }
            PerformanceLevel::Custom => {
                if self.delay_offload_entries_limit < MIN_DELAY_OFFLOAD_ENTRIES {
                    warn!(
                        cache = cache_name,
                        value = self.delay_offload_entries_limit,
                        "delay_offload_entries_limit below minimum, clamping"
                    );
                    self.delay_offload_entries_limit = MIN_DELAY_OFFLOAD_ENTRIES;
                }
                if self.delay_offload_dependency_buckets < MIN_DELAY_OFFLOAD_BUCKETS {
                    warn!(
                        cache = cache_name,
                        value = self.delay_offload_dependency_buckets,
                        "delay_offload_dependency_buckets below minimum, clamping"
                    );
                    self.delay_offload_dependency_buckets = MIN_DELAY_OFFLOAD_BUCKETS;
                }
                if self.delay_offload_template_buckets < MIN_DELAY_OFFLOAD_BUCKETS {
                    warn!(
                        cache = cache_name,
                        value = self.delay_offload_template_buckets,
                        "delay_offload_template_buckets below minimum, clamping"
                    );
                    self.delay_offload_template_buckets = MIN_DELAY_OFFLOAD_BUCKETS;
                }
            }
        }

        if self.cleanup_frequency_mins > MAX_CLEANUP_FREQUENCY_MINS {
            warn!(
                cache = cache_name,
                value = self.cleanup_frequency_mins,
                "cleanup_frequency_mins above maximum, clamping"
            );
            self.cleanup_frequency_mins = MAX_CLEANUP_FREQUENCY_MINS;
        }
        if self.cleanup_hour > 23 {
            warn!(cache = cache_name, value = self.cleanup_hour, "cleanup_hour out of range, using 0");
            self.cleanup_hour = 0;
        }

        if self.eviction_policy != DiskEvictionPolicy::None
            && (self.high_threshold > 100 || self.low_threshold == 0 || self.high_threshold <= self.low_threshold)
        {
            warn!(
                cache = cache_name,
                high = self.high_threshold,
                low = self.low_threshold,
                "invalid disk thresholds, using defaults"
            );
            self.high_threshold = DEFAULT_HIGH_THRESHOLD;
            self.low_threshold = DEFAULT_LOW_THRESHOLD;
        }

        if self.invalidation_buffer_size == 0 {
            warn!(cache = cache_name, "invalidation_buffer_size must be positive, using 1000");
            self.invalidation_buffer_size = 1000;
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Configuration for one cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache instance name, also names the disk subdirectory
    pub name: String,
    /// Maximum number of entries held in memory
    pub cache_size_limit: usize,
    /// Highest entry priority; the clock has `max_priority + 1` buckets
    pub max_priority: u8,
    /// Priority given to entries that do not set one
    pub default_priority: u8,
    /// Sharing policy used for remote pulls
    pub sharing_policy: SharingPolicy,
    /// Leave values out of invalidation events
    pub ignore_value_in_invalidation_event: bool,
    /// Event channel capacity
    pub event_channel_capacity: usize,
    /// Seconds between expiration sweeps
    pub expiration_sweep_interval_secs: u64,
    /// Disk tier configuration
    pub disk: DiskConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "baseCache".to_string(),
            cache_size_limit: 2000,
            max_priority: 16,
            default_priority: 1,
            sharing_policy: SharingPolicy::NotShared,
            ignore_value_in_invalidation_event: false,
            event_channel_capacity: 1024,
            expiration_sweep_interval_secs: 1,
            disk: DiskConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a config with the given name and defaults elsewhere
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: CacheConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Clamp out-of-range values; fails only on values that cannot be fixed
    pub fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("cache name must not be empty".into()));
        }
        if self.cache_size_limit == 0 {
            return Err(Error::Configuration("cache_size_limit must be positive".into()));
        }
        if self.max_priority == 0 {
            warn!(cache = %self.name, "max_priority must be at least 1, using 1");
            self.max_priority = 1;
        }
        if self.default_priority > self.max_priority {
            warn!(
                cache = %self.name,
                default_priority = self.default_priority,
                max_priority = self.max_priority,
                "default_priority above max_priority, clamping"
            );
            self.default_priority = self.max_priority;
        }
        if self.event_channel_capacity == 0 {
            self.event_channel_capacity = 1;
        }
        let name = self.name.clone();
        self.disk.validate(&name);
        Ok(())
    }

    /// Disk file name for this instance, with path separators replaced
    pub fn disk_cache_name(&self) -> String {
        self.name.replace(['/', '\\'], "_")
    }
}
