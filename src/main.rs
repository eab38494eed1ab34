//! Tiered Object Cache
//!
//! Command-line driver: builds a cache from a YAML config, runs a mixed
//! read/write/invalidate workload against it and prints the statistics.
//!
//! ```text
//!   config.yaml ──▶ TieredCache ──▶ workload (get / put / invalidate)
//!                        │
//!                        └──▶ stats (text or JSON)
//! ```

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_object_cache::{CacheConfig, CacheEntry, CacheEvent, CacheStatsSnapshot, TieredCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered object cache workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML cache configuration; defaults apply when omitted
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable the disk tier at this location, overriding the config
    #[arg(long, env = "CACHE_DISK_LOCATION")]
    disk_location: Option<PathBuf>,

    /// Number of operations to run
    #[arg(long, default_value = "100000")]
    operations: u64,

    /// Distinct cache ids in the key space
    #[arg(long, default_value = "5000")]
    keys: u64,

    /// Distinct dependency ids shared by entries
    #[arg(long, default_value = "50")]
    dependencies: u64,

    /// Payload size in bytes
    #[arg(long, default_value = "256")]
    value_size: usize,

    /// Percentage of operations that are writes
    #[arg(long, default_value = "20")]
    write_percent: u8,

    /// Percentage of operations that invalidate a dependency id
    #[arg(long, default_value = "1")]
    invalidate_percent: u8,

    /// Random seed for a reproducible run
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print statistics as JSON
    #[arg(long)]
    stats_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading cache config from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(location) = &args.disk_location {
        config.disk.enabled = true;
        config.disk.location = location.clone();
    }

    info!("Starting Tiered Object Cache");
    info!("  Version: {}", tiered_object_cache::VERSION);
    info!("  Cache: {}", config.name);
    info!("  Memory limit: {} entries", config.cache_size_limit);
    info!("  Disk tier: {}", config.disk.enabled);

    let cache = TieredCache::new(config).context("creating cache")?;
    cache.start();

    let mut events = cache.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CacheEvent::DiskDisabled { reason }) => {
                    warn!(reason = %reason, "disk tier disabled during run");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let elapsed = run_workload(&cache, &args);
    info!(
        operations = args.operations,
        elapsed_ms = elapsed.as_millis() as u64,
        "workload finished"
    );

    let stats = cache.stats();
    cache.stop().await.context("stopping cache")?;
    watcher.abort();

    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

fn run_workload(cache: &TieredCache, args: &Args) -> std::time::Duration {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let value = vec![0xAB; args.value_size];
    let keys = args.keys.max(1);
    let dependencies = args.dependencies.max(1);
    let started = Instant::now();

    for _ in 0..args.operations {
        let roll = rng.gen_range(0..100u8);
        if roll < args.invalidate_percent {
            let dependency = format!("dep:{}", rng.gen_range(0..dependencies));
            cache.invalidate(&dependency);
        } else if roll < args.invalidate_percent.saturating_add(args.write_percent) {
            let key = rng.gen_range(0..keys);
            let entry = CacheEntry::new(format!("obj:{}", key), value.clone())
                .with_dependency(format!("dep:{}", key % dependencies))
                .with_priority(cache.config().default_priority);
            if let Err(e) = cache.put(entry) {
                warn!(key, error = %e, "write failed");
            }
        } else {
            let key = rng.gen_range(0..keys);
            cache.get(&format!("obj:{}", key));
        }
    }
    started.elapsed()
}

fn print_stats(stats: &CacheStatsSnapshot) {
    println!("memory: {} entries, {} hits, {} misses, {} evictions, {} spills",
        stats.memory_entries, stats.memory.hits, stats.memory.misses, stats.memory.evictions, stats.memory.spills);
    println!("disk:   {} entries, {} bytes, {} hits, {} misses",
        stats.disk_entries, stats.disk_bytes, stats.disk.hits, stats.disk.misses);
    println!("hit ratio: {:.2}%", stats.hit_ratio() * 100.0);
    println!("promotions: {}, overflow allocations: {}, disk errors: {}",
        stats.promotions, stats.overflow_allocations, stats.disk_write_failures);
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
