//! The composed request pipeline.
//!
//! A [`ServiceContext`] owns one instance of every component, built once from
//! a validated [`ResilienceConfig`]. Each guarded request flows through:
//!
//! ```text
//! in-flight queue -> rate limiter -> cache lookup (return on hit)
//!     -> circuit breaker( retry( operation ) ) -> cache store
//! ```
//!
//! The request holds an in-flight ticket for its whole duration, so the
//! queue depth is the number of requests currently inside the pipeline.
//!
//! # Example
//!
//! ```rust
//! use floodgate::{GuardedRequest, ResilienceConfig, ServedFrom, ServiceContext};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = ServiceContext::local(ResilienceConfig::default())?;
//! let request = GuardedRequest::new("tenant-a", "inventory-db").cache_key("sku:1");
//!
//! let served = context
//!     .execute(
//!         &request,
//!         || async { Ok::<_, std::io::Error>(7u32) },
//!         |_err| true,
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! assert_eq!(served.source, ServedFrom::Origin);
//! # Ok(())
//! # }
//! ```

use crate::breaker::{CircuitBreakerRegistry, CircuitState};
use crate::cache::{NoopRemoteStore, RemoteStore, TieredCache};
use crate::config::ResilienceConfig;
use crate::error::{AdmissionError, ConfigError, FloodgateError};
use crate::health::{ComponentHealth, HealthReport};
use crate::limiter::TieredRateLimiter;
use crate::metrics::ResilienceSnapshot;
use crate::queue::BackpressureQueue;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Who is asking, which dependency serves them, and how to cache the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedRequest {
    principal: String,
    credential: Option<String>,
    dependency: String,
    cache_key: Option<String>,
    cache_ttl: Option<Duration>,
}

impl GuardedRequest {
    /// A request from `principal` served by `dependency`.
    #[must_use]
    pub fn new(principal: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            credential: None,
            dependency: dependency.into(),
            cache_key: None,
            cache_ttl: None,
        }
    }

    /// Rate-limit this request under a credential as well.
    #[must_use]
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Serve from and populate the cache under `key`.
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Cache the result for `ttl` in both tiers instead of the tier defaults.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// The requesting principal.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The guarded dependency.
    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }
}

/// Where a served value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    /// A cache tier.
    Cache,
    /// The guarded operation.
    Origin,
    /// The fallback, because the circuit was open.
    Fallback,
}

/// A value returned by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served<T> {
    /// The value.
    pub value: T,
    /// Where it came from.
    pub source: ServedFrom,
}

impl<T> Served<T> {
    /// Whether the value was produced by a fallback.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.source == ServedFrom::Fallback
    }

    /// Discard the source.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Releases the in-flight slot when the request finishes or is dropped.
struct InFlightTicket<'a> {
    queue: &'a BackpressureQueue<()>,
}

impl Drop for InFlightTicket<'_> {
    fn drop(&mut self) {
        let _ = self.queue.try_recv();
    }
}

/// Owns every resilience component and runs the guarded pipeline.
pub struct ServiceContext {
    config: ResilienceConfig,
    in_flight: BackpressureQueue<()>,
    limiter: TieredRateLimiter,
    cache: TieredCache,
    breakers: CircuitBreakerRegistry,
    retry: RetryPolicy,
}

impl ServiceContext {
    /// Build every component from `config`, with `remote` as the L2 store.
    pub fn new(config: ResilienceConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            in_flight: BackpressureQueue::new(config.queue.clone()),
            limiter: TieredRateLimiter::new(config.rate_limit.clone()),
            cache: TieredCache::new(config.cache.clone(), remote),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            config,
        })
    }

    /// Build a context without a remote cache tier.
    pub fn local(config: ResilienceConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(NoopRemoteStore))
    }

    /// Replace the retry policy built from configuration.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &TieredRateLimiter {
        &self.limiter
    }

    /// The cache.
    #[must_use]
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    /// The circuit breakers.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Requests currently inside the pipeline.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.depth()
    }

    /// Run `op` through the full pipeline.
    ///
    /// Overload (`RateLimitExceeded`, `QueueFull`, `EnqueueTimeout`) and
    /// `CircuitOpen` are returned without invoking `op`. Errors for which
    /// `classify` returns `true` are retried per the retry policy.
    /// Only errors that survive retry (or time out) count against the
    /// dependency's breaker; an error `classify` rejects is returned as
    /// [`FloodgateError::Operation`] and leaves the circuit untouched.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        request: &GuardedRequest,
        op: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<Served<T>, FloodgateError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let _ticket = self.admit(request, cancel).await?;
        if let Some(value) = self.cached(request).await {
            return Ok(Served {
                value,
                source: ServedFrom::Cache,
            });
        }

        let breaker = self.breakers.get_or_create(&request.dependency);
        let value = breaker
            .call_with_classifier(
                || self.retry.run(op, classify, cancel),
                FloodgateError::is_dependency_failure,
                cancel,
            )
            .await?;

        self.store(request, &value).await;
        Ok(Served {
            value,
            source: ServedFrom::Origin,
        })
    }

    /// Like [`execute`](Self::execute), but serves `fallback` when the
    /// dependency's circuit is open.
    ///
    /// Fallback values are never cached.
    pub async fn execute_with_fallback<T, E, F, Fut, C, G, GFut>(
        &self,
        request: &GuardedRequest,
        op: F,
        classify: C,
        fallback: G,
        cancel: &CancellationToken,
    ) -> Result<Served<T>, FloodgateError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: fmt::Display,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let _ticket = self.admit(request, cancel).await?;
        if let Some(value) = self.cached(request).await {
            return Ok(Served {
                value,
                source: ServedFrom::Cache,
            });
        }

        let breaker = self.breakers.get_or_create(&request.dependency);
        let outcome = breaker
            .call_with_fallback_and_classifier(
                || self.retry.run(op, classify, cancel),
                FloodgateError::is_dependency_failure,
                || async move { fallback().await.map_err(FloodgateError::Operation) },
                cancel,
            )
            .await?;

        if outcome.degraded {
            debug!(dependency = %request.dependency, "served from fallback");
            return Ok(Served {
                value: outcome.value,
                source: ServedFrom::Fallback,
            });
        }
        self.store(request, &outcome.value).await;
        Ok(Served {
            value: outcome.value,
            source: ServedFrom::Origin,
        })
    }

    async fn admit(
        &self,
        request: &GuardedRequest,
        cancel: &CancellationToken,
    ) -> Result<InFlightTicket<'_>, AdmissionError> {
        self.in_flight
            .admit_with_cancel((), self.config.queue.enqueue_timeout_duration(), cancel)
            .await?;
        let ticket = InFlightTicket {
            queue: &self.in_flight,
        };
        self.limiter
            .check(&request.principal, request.credential.as_deref())?;
        Ok(ticket)
    }

    async fn cached<T: DeserializeOwned>(&self, request: &GuardedRequest) -> Option<T> {
        let key = request.cache_key.as_deref()?;
        let bytes = self.cache.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(key, "served from cache");
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "undecodable cache entry, treating as miss");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, request: &GuardedRequest, value: &T) {
        let Some(key) = request.cache_key.as_deref() else {
            return;
        };
        let bytes = match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                warn!(key, error = %err, "result not cacheable");
                return;
            }
        };
        match request.cache_ttl {
            Some(ttl) => self.cache.set(key, bytes, ttl).await,
            None => self.cache.set_default(key, bytes).await,
        }
    }

    /// Counters of every component.
    #[must_use]
    pub fn snapshot(&self) -> ResilienceSnapshot {
        ResilienceSnapshot {
            rate_limit: self.limiter.stats(),
            circuits: self.breakers.snapshots(),
            queue: self.in_flight.stats(),
            cache: self.cache.stats(),
        }
    }

    /// Overall and per-component health.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let queue = self.in_flight.stats();
        let queue_health = if self.in_flight.is_healthy() {
            ComponentHealth::healthy()
        } else {
            ComponentHealth::degraded(format!(
                "in-flight utilization {:.0}% at or above threshold",
                queue.utilization * 100.0
            ))
        };
        let mut components = vec![(
            "queue".to_string(),
            queue_health
                .with_detail("depth", queue.depth)
                .with_detail("max_depth", queue.max_depth),
        )];

        for circuit in self.breakers.snapshots() {
            let health = match circuit.state {
                CircuitState::Closed => ComponentHealth::healthy(),
                CircuitState::HalfOpen => ComponentHealth::degraded("circuit half-open"),
                CircuitState::Open => ComponentHealth::unhealthy("circuit open"),
            };
            components.push((
                format!("circuit:{}", circuit.dependency),
                health.with_detail("opens", circuit.opens),
            ));
        }

        let cache = self.cache.stats();
        components.push((
            "cache".to_string(),
            ComponentHealth::healthy()
                .with_detail("hit_ratio", format!("{:.3}", cache.hit_ratio()))
                .with_detail("l2_errors", cache.l2_errors),
        ));

        HealthReport::from_components(components)
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("in_flight", &self.in_flight)
            .field("limiter", &self.limiter)
            .field("cache", &self.cache)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig, TierLimit};
    use crate::health::HealthStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig::default()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(30)),
            retry: RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            ..ResilienceConfig::default()
        }
    }

    fn always(_: &String) -> bool {
        true
    }

    #[tokio::test]
    async fn test_cache_hit_skips_operation() {
        let context = ServiceContext::local(config()).unwrap();
        let request = GuardedRequest::new("p", "db").cache_key("k");
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(5u32)
        };
        let cancel = CancellationToken::new();

        let first = context.execute(&request, op, always, &cancel).await.unwrap();
        assert_eq!(first.source, ServedFrom::Origin);
        let second = context.execute(&request, op, always, &cancel).await.unwrap();
        assert_eq!(second, Served { value: 5, source: ServedFrom::Cache });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_before_operation() {
        let mut config = config();
        config.rate_limit = config
            .rate_limit
            .with_per_principal(TierLimit::new(60.0, 1.0));
        let context = ServiceContext::local(config).unwrap();
        let request = GuardedRequest::new("p", "db");
        let cancel = CancellationToken::new();

        let ok = context
            .execute(&request, || async { Ok::<_, String>(1) }, always, &cancel)
            .await;
        assert!(ok.is_ok());

        let err = context
            .execute(&request, || async { Ok::<_, String>(1) }, always, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_overload());
        assert_eq!(context.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_serves_fallback_uncached() {
        let context = ServiceContext::local(config()).unwrap();
        let request = GuardedRequest::new("p", "billing").cache_key("invoice:1");
        let cancel = CancellationToken::new();

        let err = context
            .execute(&request, || async { Err::<u32, _>("down".to_string()) }, always, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.operation_error().map(String::as_str), Some("down"));

        let served = context
            .execute_with_fallback(
                &request,
                || async { Ok::<_, String>(1u32) },
                always,
                || async { Ok(0u32) },
                &cancel,
            )
            .await
            .unwrap();
        assert!(served.is_degraded());
        assert_eq!(context.cache().stats().l1_entries, 0);

        let health = context.health();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.components_with(HealthStatus::Unhealthy), vec!["circuit:billing"]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.queue.max_depth = 0;
        assert!(matches!(
            ServiceContext::local(config),
            Err(ConfigError::Invalid { field: "queue.max_depth", .. })
        ));
    }
}
