//! Benchmarks for floodgate.
//!
//! This crate contains Criterion benchmarks for the hot paths every guarded
//! request goes through:
//!
//! - **Rate limiting**: token bucket acquisition and tiered limiter checks
//! - **Circuit breaking**: admission and outcome recording on a closed circuit
//! - **Caching**: L1 hits, misses and writes through `TieredCache`
//!
//! ## Running Benchmarks
//!
//! Run all benchmarks:
//! ```bash
//! cargo bench --package floodgate-benches
//! ```
//!
//! Run specific benchmark:
//! ```bash
//! cargo bench --package floodgate-benches --bench rate_limit
//! cargo bench --package floodgate-benches --bench breaker
//! cargo bench --package floodgate-benches --bench cache
//! ```
//!
//! Run with fewer samples for quick validation:
//! ```bash
//! cargo bench --package floodgate-benches -- --sample-size 10
//! ```
//!
//! ## Benchmark Results
//!
//! Results are written to `target/criterion/` with HTML reports.
//! Open `target/criterion/report/index.html` for a summary.
//!
//! ## Benchmark Groups
//!
//! ### Rate limiting (`benches/rate_limit.rs`)
//! - `token_bucket`: single-bucket acquisition
//! - `tiered_limiter`: global, per-principal and per-credential checks
//! - `limiter_fanout`: checks spread over many principals
//!
//! ### Circuit breaking (`benches/breaker.rs`)
//! - `breaker_call`: guarded call overhead on a closed circuit
//! - `registry_lookup`: per-dependency breaker lookup
//!
//! ### Caching (`benches/cache.rs`)
//! - `l1_get`: local hits and misses
//! - `l1_set`: writes with eviction at capacity
