//! Configuration fixtures.
//!
//! Small limits and short timeouts so tests reach every state quickly.

use floodgate::config::{
    CacheConfig, CircuitBreakerConfig, QueueConfig, RateLimitConfig, ResilienceConfig,
    RetryConfig, TierLimit,
};
use std::time::Duration;

/// A configuration with no rate limits, a fast breaker and fast retries.
///
/// - breaker: opens after 3 failures, recovers after 10s, closes after 1 success
/// - retry: 3 attempts, 10ms base delay, 100ms cap
/// - queue: 16 in flight, no enqueue wait
/// - cache: 64 L1 entries, 60s TTLs, 50ms remote timeout
#[must_use]
pub fn fast_config() -> ResilienceConfig {
    ResilienceConfig {
        rate_limit: RateLimitConfig::default(),
        circuit_breaker: breaker_config(3, Duration::from_secs(10)),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            attempt_timeout_ms: None,
            overall_timeout_ms: None,
        },
        queue: QueueConfig::new(16),
        cache: CacheConfig::default()
            .l1_max_entries(64)
            .l1_ttl(Duration::from_secs(60))
            .l2_ttl(Duration::from_secs(60))
            .l2_timeout(Duration::from_millis(50)),
    }
}

/// [`fast_config`] with a global rate limit.
#[must_use]
pub fn with_global_limit(requests_per_minute: f64, burst_size: f64) -> ResilienceConfig {
    let mut config = fast_config();
    config.rate_limit = config
        .rate_limit
        .with_global(TierLimit::new(requests_per_minute, burst_size));
    config
}

/// A breaker that closes again after a single successful trial call.
#[must_use]
pub fn breaker_config(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .failure_threshold(failure_threshold)
        .success_threshold(1)
        .recovery_timeout(recovery_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_are_valid() {
        assert!(fast_config().validate().is_ok());
        assert!(with_global_limit(60.0, 10.0).validate().is_ok());
    }
}
