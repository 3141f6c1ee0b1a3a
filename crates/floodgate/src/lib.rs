//! Resilience and traffic control for request-handling services.
//!
//! This crate sits in front of (and inside) a service that handles requests
//! on behalf of many principals and calls out to unreliable dependencies.
//! It sheds load before work starts, stops hammering failing dependencies,
//! retries transient failures, and serves repeated reads from a two-tier
//! cache.
//!
//! # Overview
//!
//! Components, leaves first:
//!
//! - [`TokenBucket`]: rate-limiting counter with continuous refill
//! - [`TieredRateLimiter`]: global, per-principal and per-credential buckets
//!   combined into one admission decision
//! - [`CircuitBreaker`]: closed/open/half-open state machine per dependency
//! - [`RetryPolicy`]: exponential backoff with jitter, timeouts and
//!   cancellation
//! - [`BackpressureQueue`]: bounded FIFO that rejects or times out when full
//! - [`TieredCache`]: in-process L1 over a shared [`RemoteStore`] L2
//! - [`ServiceContext`]: owns one of each, built from a validated
//!   [`ResilienceConfig`]
//!
//! # Example
//!
//! ```rust
//! use floodgate::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::from_json_str(r#"{
//!     "rate_limit": { "global": { "requests_per_minute": 600, "burst_size": 50 } },
//!     "circuit_breaker": { "failure_threshold": 3, "recovery_timeout_secs": 10 }
//! }"#)?;
//! let context = ServiceContext::local(config)?;
//!
//! let request = GuardedRequest::new("tenant-a", "pricing-api").cache_key("price:42");
//! let served = context
//!     .execute(
//!         &request,
//!         || async { Ok::<_, std::io::Error>(1999u64) },
//!         |err: &std::io::Error| err.kind() == std::io::ErrorKind::TimedOut,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(served.value, 1999);
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Guarded calls return [`FloodgateError`], generic over the operation's own
//! error type. Overload errors ([`FloodgateError::is_overload`]) mean the
//! request was shed before any work happened and should be surfaced to the
//! caller as-is. Remote cache failures never surface; they are logged and
//! treated as misses.
//!
//! # Logging
//!
//! Components emit [`tracing`] events: breaker transitions at `warn`/`info`,
//! retries at `warn`, remote cache degradation at `warn`, rate-limit
//! rejections and idle sweeps at `debug`. Install any subscriber to see them.

#![deny(missing_docs)]

pub mod breaker;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod retry;

// Re-export commonly used types
pub use breaker::{CallOutcome, CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use bucket::TokenBucket;
pub use cache::{
    CacheStats, MemoryStore, NoopRemoteStore, PrefixBatch, RemoteEntry, RemoteStore, TieredCache,
};
pub use config::{
    CacheConfig, CircuitBreakerConfig, QueueConfig, RateLimitConfig, ResilienceConfig,
    RetryConfig, TierEvaluation, TierLimit,
};
pub use context::{GuardedRequest, Served, ServedFrom, ServiceContext};
pub use error::{AdmissionError, CacheError, Cancelled, CircuitOpen, ConfigError, FloodgateError};
pub use health::{ComponentHealth, HealthReport, HealthStatus};
pub use limiter::{RateLimitDecision, RateLimitStats, RateLimitTier, TieredRateLimiter};
pub use metrics::ResilienceSnapshot;
pub use queue::{BackpressureQueue, PendingWork, QueueStats};
pub use retry::{Jitter, RetryPolicy};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
    pub use crate::cache::{MemoryStore, RemoteStore, TieredCache};
    pub use crate::config::{ResilienceConfig, TierLimit};
    pub use crate::context::{GuardedRequest, Served, ServedFrom, ServiceContext};
    pub use crate::error::{AdmissionError, FloodgateError};
    pub use crate::health::HealthStatus;
    pub use crate::limiter::{RateLimitTier, TieredRateLimiter};
    pub use crate::queue::BackpressureQueue;
    pub use crate::retry::{Jitter, RetryPolicy};
}
