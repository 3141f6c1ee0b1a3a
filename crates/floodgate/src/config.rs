//! Typed configuration for every resilience component.
//!
//! Configuration is supplied once at construction. Every option has a
//! default, so a partial JSON document is enough:
//!
//! ```rust
//! use floodgate::config::ResilienceConfig;
//!
//! let config = ResilienceConfig::from_json_str(r#"{
//!     "rate_limit": { "global": { "requests_per_minute": 600, "burst_size": 50 } },
//!     "circuit_breaker": { "failure_threshold": 3 }
//! }"#).unwrap();
//!
//! assert_eq!(config.circuit_breaker.failure_threshold, 3);
//! assert_eq!(config.retry.max_attempts, 3);
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Whole seconds in `d`, rounding any remainder up so short durations never
/// become zero.
const fn whole_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs().saturating_add(1)
    } else {
        d.as_secs()
    }
}

/// Whole milliseconds in `d`, rounded up and saturating at `u64::MAX`.
const fn whole_millis(d: Duration) -> u64 {
    let mut millis = d.as_millis();
    if d.subsec_nanos() % 1_000_000 > 0 {
        millis += 1;
    }
    if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    }
}

/// Limits for a single rate-limit tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Sustained rate, refilled continuously.
    pub requests_per_minute: f64,
    /// Maximum burst (bucket capacity).
    pub burst_size: f64,
}

impl TierLimit {
    /// Create a tier limit.
    #[must_use]
    pub const fn new(requests_per_minute: f64, burst_size: f64) -> Self {
        Self {
            requests_per_minute,
            burst_size,
        }
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate_per_second(&self) -> f64 {
        self.requests_per_minute / 60.0
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !(self.requests_per_minute.is_finite() && self.requests_per_minute > 0.0) {
            return Err(ConfigError::invalid(
                field,
                format!(
                    "requests_per_minute must be positive, got {}",
                    self.requests_per_minute
                ),
            ));
        }
        if !(self.burst_size.is_finite() && self.burst_size >= 0.0) {
            return Err(ConfigError::invalid(
                field,
                format!("burst_size must be non-negative, got {}", self.burst_size),
            ));
        }
        Ok(())
    }
}

/// How the tiered limiter combines its tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierEvaluation {
    /// Stop at the first tier that denies.
    #[default]
    ShortCircuit,
    /// Evaluate every tier and report all that denied.
    AllTiers,
}

/// Tiered rate limiting configuration. A missing tier admits everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit shared by every request.
    pub global: Option<TierLimit>,
    /// Limit per principal (user, tenant).
    pub per_principal: Option<TierLimit>,
    /// Limit per credential (API key).
    pub per_credential: Option<TierLimit>,
    /// Buckets unused for this long are swept.
    pub idle_ttl_secs: u64,
    /// Run an idle sweep every this many admission checks. Zero disables.
    pub sweep_interval: u64,
    /// Tier evaluation strategy.
    pub evaluation: TierEvaluation,
}

impl RateLimitConfig {
    /// Set the global tier.
    #[must_use]
    pub fn with_global(mut self, limit: TierLimit) -> Self {
        self.global = Some(limit);
        self
    }

    /// Set the per-principal tier.
    #[must_use]
    pub fn with_per_principal(mut self, limit: TierLimit) -> Self {
        self.per_principal = Some(limit);
        self
    }

    /// Set the per-credential tier.
    #[must_use]
    pub fn with_per_credential(mut self, limit: TierLimit) -> Self {
        self.per_credential = Some(limit);
        self
    }

    /// Set the idle TTL, rounded up to whole seconds.
    #[must_use]
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl_secs = whole_secs(ttl);
        self
    }

    /// Set the tier evaluation strategy.
    #[must_use]
    pub fn with_evaluation(mut self, evaluation: TierEvaluation) -> Self {
        self.evaluation = evaluation;
        self
    }

    /// Idle TTL as a duration.
    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = &self.global {
            limit.validate("rate_limit.global")?;
        }
        if let Some(limit) = &self.per_principal {
            limit.validate("rate_limit.per_principal")?;
        }
        if let Some(limit) = &self.per_credential {
            limit.validate("rate_limit.per_credential")?;
        }
        if self.idle_ttl_secs == 0 {
            return Err(ConfigError::invalid(
                "rate_limit.idle_ttl_secs",
                "must be at least one second",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: None,
            per_principal: None,
            per_credential: None,
            idle_ttl_secs: 3600,
            sweep_interval: 10_000,
            evaluation: TierEvaluation::ShortCircuit,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive HalfOpen successes that close the circuit.
    pub success_threshold: u32,
    /// Time the circuit stays Open before a trial call is allowed.
    pub recovery_timeout_secs: u64,
    /// Concurrent trial calls allowed while HalfOpen.
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the recovery timeout, rounded up to whole seconds.
    #[must_use]
    pub const fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_secs = whole_secs(timeout);
        self
    }

    /// Set the number of concurrent HalfOpen trial calls.
    #[must_use]
    pub const fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Recovery timeout as a duration.
    #[must_use]
    pub fn recovery_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.half_open_max_calls",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_secs: 30,
            half_open_max_calls: 1,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff delay.
    pub max_delay_ms: u64,
    /// Bound on each individual attempt.
    pub attempt_timeout_ms: Option<u64>,
    /// Bound on the whole retry loop, waits included.
    pub overall_timeout_ms: Option<u64>,
}

impl RetryConfig {
    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!(
                    "must be >= base_delay_ms ({} < {})",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }
        if self.attempt_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "retry.attempt_timeout_ms",
                "must be positive when set",
            ));
        }
        if self.overall_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "retry.overall_timeout_ms",
                "must be positive when set",
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            attempt_timeout_ms: None,
            overall_timeout_ms: None,
        }
    }
}

/// Backpressure queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of queued items.
    pub max_depth: usize,
    /// How long an admission may wait for a free slot. Zero rejects at once.
    pub enqueue_timeout_ms: u64,
    /// Utilization at or above which the queue reports unhealthy.
    pub health_threshold: f64,
}

impl QueueConfig {
    /// Create a queue configuration with the given depth.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            ..Self::default()
        }
    }

    /// Set the enqueue timeout.
    #[must_use]
    pub fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout_ms = whole_millis(timeout);
        self
    }

    /// Enqueue timeout as a duration.
    #[must_use]
    pub fn enqueue_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::invalid("queue.max_depth", "must be at least 1"));
        }
        if !(self.health_threshold > 0.0 && self.health_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "queue.health_threshold",
                format!("must be in (0, 1], got {}", self.health_threshold),
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 1024,
            enqueue_timeout_ms: 0,
            health_threshold: 0.8,
        }
    }
}

/// Two-tier cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of the in-process tier.
    pub l1_max_entries: usize,
    /// Default TTL of in-process entries.
    pub l1_ttl_secs: u64,
    /// Default TTL of remote entries.
    pub l2_ttl_secs: u64,
    /// Timeout for every remote call.
    pub l2_timeout_ms: u64,
}

impl CacheConfig {
    /// Set the in-process capacity.
    #[must_use]
    pub const fn l1_max_entries(mut self, entries: usize) -> Self {
        self.l1_max_entries = entries;
        self
    }

    /// Set the in-process TTL, rounded up to whole seconds.
    #[must_use]
    pub const fn l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl_secs = whole_secs(ttl);
        self
    }

    /// Set the remote TTL, rounded up to whole seconds.
    #[must_use]
    pub const fn l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl_secs = whole_secs(ttl);
        self
    }

    /// Set the remote call timeout.
    #[must_use]
    pub const fn l2_timeout(mut self, timeout: Duration) -> Self {
        self.l2_timeout_ms = whole_millis(timeout);
        self
    }

    /// In-process TTL as a duration.
    #[must_use]
    pub fn l1_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    /// Remote TTL as a duration.
    #[must_use]
    pub fn l2_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }

    /// Remote call timeout as a duration.
    #[must_use]
    pub fn l2_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_max_entries == 0 {
            return Err(ConfigError::invalid(
                "cache.l1_max_entries",
                "must be at least 1",
            ));
        }
        if self.l1_ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.l1_ttl_secs", "must be positive"));
        }
        if self.l2_ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.l2_ttl_secs", "must be positive"));
        }
        if self.l2_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "cache.l2_timeout_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 10_000,
            l1_ttl_secs: 60,
            l2_ttl_secs: 300,
            l2_timeout_ms: 50,
        }
    }
}

/// Configuration for the whole resilience layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Tiered rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker thresholds, applied to every dependency.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Backpressure queue.
    pub queue: QueueConfig,
    /// Tiered cache.
    pub cache: CacheConfig,
}

impl ResilienceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.queue.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.idle_ttl(), Duration::from_secs(3600));
        assert_eq!(config.queue.health_threshold, 0.8);
        assert_eq!(config.cache.l2_timeout_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = ResilienceConfig::from_json_str(
            r#"{
                "rate_limit": {
                    "global": { "requests_per_minute": 60, "burst_size": 10 },
                    "evaluation": "all_tiers"
                },
                "queue": { "max_depth": 8, "enqueue_timeout_ms": 250 }
            }"#,
        )
        .unwrap();

        let global = config.rate_limit.global.unwrap();
        assert_eq!(global.refill_rate_per_second(), 1.0);
        assert_eq!(config.rate_limit.evaluation, TierEvaluation::AllTiers);
        assert!(config.rate_limit.per_principal.is_none());
        assert_eq!(
            config.queue.enqueue_timeout_duration(),
            Duration::from_millis(250)
        );
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_rejects_zero_failure_threshold() {
        let err = ResilienceConfig::from_json_str(r#"{"circuit_breaker": {"failure_threshold": 0}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("circuit_breaker.failure_threshold"));
    }

    #[test]
    fn test_rejects_max_delay_below_base() {
        let config = RetryConfig {
            base_delay_ms: 500,
            max_delay_ms: 100,
            ..RetryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "retry.max_delay_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let config = RateLimitConfig::default().with_global(TierLimit::new(0.0, 10.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_health_threshold() {
        let config = QueueConfig {
            health_threshold: 1.5,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ResilienceConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floodgate.json");
        std::fs::write(&path, r#"{"queue": {"max_depth": 8}}"#).unwrap();

        let config = ResilienceConfig::from_path(&path).unwrap();
        assert_eq!(config.queue.max_depth, 8);
        assert!(matches!(
            ResilienceConfig::from_path(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_sub_second_durations_round_up() {
        let breaker = CircuitBreakerConfig::default().recovery_timeout(Duration::from_millis(500));
        assert_eq!(breaker.recovery_timeout_duration(), Duration::from_secs(1));

        let breaker = CircuitBreakerConfig::default().recovery_timeout(Duration::from_secs(2));
        assert_eq!(breaker.recovery_timeout_secs, 2);

        let cache = CacheConfig::default()
            .l1_ttl(Duration::from_millis(1500))
            .l2_ttl(Duration::from_millis(1))
            .l2_timeout(Duration::from_micros(10));
        assert_eq!(cache.l1_ttl_secs, 2);
        assert_eq!(cache.l2_ttl_secs, 1);
        assert_eq!(cache.l2_timeout_ms, 1);
        assert!(cache.validate().is_ok());

        let limits = RateLimitConfig::default().with_idle_ttl(Duration::from_millis(10));
        assert_eq!(limits.idle_ttl(), Duration::from_secs(1));
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }
}
