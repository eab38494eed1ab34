//! Benchmark for the priority clock and the memory tier
//!
//! Target: eviction cost independent of cache size

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tiered_object_cache::cache::{EntryPool, PriorityClock};
use tiered_object_cache::{CacheConfig, CacheEntry, TieredCache};

fn bench_select_victim(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_clock");
    group.throughput(Throughput::Elements(1));

    for size in [1_000usize, 100_000] {
        group.bench_with_input(BenchmarkId::new("evict_and_refill", size), &size, |b, &size| {
            let mut pool = EntryPool::with_capacity(size);
            let mut clock = PriorityClock::new(16);
            for i in 0..size {
                let handle = pool.allocate();
                let entry = pool.get_mut(handle).unwrap();
                *entry = CacheEntry::new(format!("e{}", i), "v").with_priority((i % 17) as u8);
                clock.update_location(handle, entry);
            }

            b.iter(|| {
                let victim = clock.select_victim(&mut pool).unwrap();
                let entry = pool.get_mut(victim).unwrap();
                clock.remove(victim, entry);
                clock.update_location(black_box(victim), entry);
            });
        });
    }

    group.finish();
}

fn bench_put_at_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiered_cache");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let cache = TieredCache::new(CacheConfig {
        cache_size_limit: 10_000,
        ..CacheConfig::named("bench")
    })
    .unwrap();
    for i in 0..10_000 {
        cache.put(CacheEntry::new(format!("seed-{}", i), "v")).unwrap();
    }

    group.bench_function("put_with_eviction", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let entry = CacheEntry::new(format!("key-{}", counter), "value").with_dependency("bench");
            let _ = cache.put(black_box(entry));
        });
    });

    group.bench_function("get_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let id = format!("key-{}", counter % 1000 + 1);
            black_box(cache.get(&id));
        });
    });

    group.finish();
}

fn bench_concurrent_gets(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiered_cache");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = rt.block_on(async {
        let cache = TieredCache::new(CacheConfig::named("bench")).unwrap();
        for i in 0..1000 {
            cache.put(CacheEntry::new(format!("key-{}", i), "v")).unwrap();
        }
        cache
    });

    group.bench_function("concurrent_100_gets", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let cache = Arc::clone(&cache);
                    handles.push(tokio::spawn(async move {
                        cache.get(&format!("key-{}", i * 7 % 1000))
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_select_victim,
    bench_put_at_capacity,
    bench_concurrent_gets,
);
criterion_main!(benches);
