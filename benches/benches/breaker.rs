//! Benchmarks for circuit breaker overhead.
//!
//! Run with: `cargo bench --package floodgate-benches --bench breaker`

// Allow missing docs for criterion_group! macro generated functions
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use floodgate::config::CircuitBreakerConfig;
use floodgate::{CircuitBreaker, CircuitBreakerRegistry, CircuitOpen};

fn bench_breaker_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("breaker_call");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    group.bench_function("closed_success", |b| {
        b.to_async(&rt).iter(|| async {
            let result: Result<u64, CircuitOpen> = breaker.call(|| async { Ok(black_box(7)) }).await;
            black_box(result)
        });
    });

    group.bench_function("snapshot", |b| b.iter(|| black_box(breaker.snapshot())));

    group.finish();
}

fn bench_registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lookup");

    for dependencies in [1usize, 16, 256] {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let names: Vec<String> = (0..dependencies).map(|i| format!("dependency-{i}")).collect();
        for name in &names {
            registry.get_or_create(name);
        }

        group.bench_with_input(BenchmarkId::new("get_or_create", dependencies), &names, |b, names| {
            b.iter(|| {
                for name in names {
                    black_box(registry.get_or_create(name));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_breaker_call, bench_registry_lookup);
criterion_main!(benches);
