//! Benchmarks for the token bucket and tiered limiter.
//!
//! Run with: `cargo bench --package floodgate-benches --bench rate_limit`

// Allow missing docs for criterion_group! macro generated functions
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use floodgate::config::{RateLimitConfig, TierLimit};
use floodgate::{TieredRateLimiter, TokenBucket};

/// Effectively unlimited so every check takes the admit path.
const WIDE_OPEN: TierLimit = TierLimit::new(1.0e9, 1.0e9);

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    let bucket = TokenBucket::new(1.0e9, 1.0e9);
    group.bench_function("allow", |b| b.iter(|| black_box(bucket.allow())));

    let empty = TokenBucket::new(1.0, 1.0e-6);
    let _ = empty.allow();
    group.bench_function("reject", |b| b.iter(|| black_box(empty.allow())));

    group.finish();
}

fn bench_tiered_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiered_limiter");

    let global_only = TieredRateLimiter::new(RateLimitConfig::default().with_global(WIDE_OPEN));
    group.bench_function("global_only", |b| {
        b.iter(|| black_box(global_only.allow(black_box("principal"), None)));
    });

    let all_tiers = TieredRateLimiter::new(
        RateLimitConfig::default()
            .with_global(WIDE_OPEN)
            .with_per_principal(WIDE_OPEN)
            .with_per_credential(WIDE_OPEN),
    );
    group.bench_function("all_tiers", |b| {
        b.iter(|| black_box(all_tiers.allow(black_box("principal"), Some("credential"))));
    });

    group.finish();
}

fn bench_limiter_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter_fanout");

    for principals in [10u64, 1_000, 10_000] {
        let limiter = TieredRateLimiter::new(RateLimitConfig::default().with_per_principal(WIDE_OPEN));
        let keys: Vec<String> = (0..principals).map(|i| format!("principal-{i}")).collect();
        for key in &keys {
            let _ = limiter.allow(key, None);
        }

        group.throughput(Throughput::Elements(principals));
        group.bench_with_input(BenchmarkId::new("per_principal", principals), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(limiter.allow(key, None));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_token_bucket,
    bench_tiered_limiter,
    bench_limiter_fanout
);
criterion_main!(benches);
