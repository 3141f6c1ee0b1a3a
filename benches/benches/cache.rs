//! Benchmarks for the local cache tier.
//!
//! Run with: `cargo bench --package floodgate-benches --bench cache`

// Allow missing docs for criterion_group! macro generated functions
#![allow(missing_docs)]

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use floodgate::TieredCache;
use floodgate::config::CacheConfig;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(600);

fn bench_l1_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("l1_get");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let cache = TieredCache::local_only(CacheConfig::default().l1_max_entries(10_000));
    rt.block_on(async {
        for i in 0..1_000 {
            cache.set(&format!("key:{i}"), Bytes::from(vec![0u8; 256]), TTL).await;
        }
    });

    group.bench_function("hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(cache.get(black_box("key:500")).await) });
    });
    group.bench_function("miss", |b| {
        b.to_async(&rt).iter(|| async { black_box(cache.get(black_box("absent")).await) });
    });

    group.finish();
}

fn bench_l1_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("l1_set");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for capacity in [100usize, 10_000] {
        let cache = TieredCache::local_only(CacheConfig::default().l1_max_entries(capacity));
        let keys: Vec<String> = (0..1_000).map(|i| format!("key:{i}")).collect();
        let value = Bytes::from(vec![0u8; 256]);

        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(BenchmarkId::new("batch_1000", capacity), &keys, |b, keys| {
            b.to_async(&rt).iter(|| async {
                for key in keys {
                    cache.set(key, value.clone(), TTL).await;
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_l1_get, bench_l1_set);
criterion_main!(benches);
