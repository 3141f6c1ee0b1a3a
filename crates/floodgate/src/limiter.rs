//! Tiered rate limiting.
//!
//! A [`TieredRateLimiter`] combines up to three token-bucket tiers into one
//! admission decision:
//!
//! 1. **global**: one bucket shared by every request;
//! 2. **principal**: one bucket per principal id (user, tenant);
//! 3. **credential**: one bucket per credential id (API key).
//!
//! Tiers are evaluated in that order. The global tier is the cheapest check
//! and protects the shared capacity, so it runs first. By default evaluation
//! stops at the first tier that denies; [`TierEvaluation::AllTiers`] reports
//! every violated tier instead.
//!
//! Per-key buckets are created on first sight and swept once they have been
//! idle longer than the configured TTL.
//!
//! # Example
//!
//! ```rust
//! use floodgate::config::{RateLimitConfig, TierLimit};
//! use floodgate::limiter::TieredRateLimiter;
//!
//! let limiter = TieredRateLimiter::new(
//!     RateLimitConfig::default()
//!         .with_global(TierLimit::new(6000.0, 100.0))
//!         .with_per_principal(TierLimit::new(60.0, 2.0)),
//! );
//!
//! assert!(limiter.allow("alice", None).allowed);
//! assert!(limiter.allow("alice", None).allowed);
//!
//! let decision = limiter.allow("alice", None);
//! assert!(!decision.allowed);
//! assert_eq!(decision.reason(), Some("principal"));
//!
//! // Other principals are unaffected
//! assert!(limiter.allow("bob", None).allowed);
//! ```

use crate::bucket::TokenBucket;
use crate::config::{RateLimitConfig, TierEvaluation, TierLimit};
use crate::error::AdmissionError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// A rate-limit tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    /// Shared by every request.
    Global,
    /// Keyed by principal id.
    Principal,
    /// Keyed by credential id.
    Credential,
}

impl RateLimitTier {
    /// The tier name used in rejection reasons.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Principal => "principal",
            Self::Credential => "credential",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Tiers that denied, in evaluation order. Empty when allowed.
    pub rejected_by: Vec<RateLimitTier>,
    /// Suggested wait before the first rejecting tier admits again.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            rejected_by: Vec::new(),
            retry_after: None,
        }
    }

    /// The first rejecting tier.
    #[must_use]
    pub fn tier(&self) -> Option<RateLimitTier> {
        self.rejected_by.first().copied()
    }

    /// Name of the first rejecting tier, e.g. `"global"`.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        self.tier().map(|t| t.as_str())
    }
}

/// Buckets for one keyed tier.
struct KeyedTier {
    limit: TierLimit,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl KeyedTier {
    fn new(limit: TierLimit) -> Self {
        Self {
            limit,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
            Arc::new(TokenBucket::new(
                self.limit.burst_size,
                self.limit.refill_rate_per_second(),
            ))
        }))
    }

    fn sweep(&self, idle_ttl: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for() < idle_ttl);
        before - buckets.len()
    }

    fn len(&self) -> usize {
        self.buckets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[derive(Debug, Default)]
struct LimiterCounters {
    checked: AtomicU64,
    allowed: AtomicU64,
    rejected_global: AtomicU64,
    rejected_principal: AtomicU64,
    rejected_credential: AtomicU64,
}

/// Multi-tier rate limiter.
///
/// Cheap to share: wrap in an `Arc` and call from any task.
pub struct TieredRateLimiter {
    config: RateLimitConfig,
    global: Option<TokenBucket>,
    principals: Option<KeyedTier>,
    credentials: Option<KeyedTier>,
    counters: LimiterCounters,
}

impl TieredRateLimiter {
    /// Create a limiter from a validated configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            global: config
                .global
                .map(|l| TokenBucket::new(l.burst_size, l.refill_rate_per_second())),
            principals: config.per_principal.map(KeyedTier::new),
            credentials: config.per_credential.map(KeyedTier::new),
            counters: LimiterCounters::default(),
            config,
        }
    }

    /// The limiter configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether a request from `principal_id` (optionally presenting
    /// `credential_id`) may proceed.
    pub fn allow(&self, principal_id: &str, credential_id: Option<&str>) -> RateLimitDecision {
        let checked = self.counters.checked.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.sweep_interval > 0 && checked % self.config.sweep_interval == 0 {
            self.sweep_idle();
        }

        let decision = match self.config.evaluation {
            TierEvaluation::ShortCircuit => self.evaluate_short_circuit(principal_id, credential_id),
            TierEvaluation::AllTiers => self.evaluate_all(principal_id, credential_id),
        };

        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            for tier in &decision.rejected_by {
                self.rejection_counter(*tier).fetch_add(1, Ordering::Relaxed);
            }
            debug!(
                principal = principal_id,
                tier = decision.reason().unwrap_or_default(),
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Like [`allow`](Self::allow), but as a `Result` for `?` propagation.
    pub fn check(
        &self,
        principal_id: &str,
        credential_id: Option<&str>,
    ) -> Result<(), AdmissionError> {
        let decision = self.allow(principal_id, credential_id);
        match decision.tier() {
            None => Ok(()),
            Some(tier) => Err(AdmissionError::RateLimitExceeded {
                tier,
                retry_after: decision.retry_after,
            }),
        }
    }

    fn evaluate_short_circuit(
        &self,
        principal_id: &str,
        credential_id: Option<&str>,
    ) -> RateLimitDecision {
        for (tier, bucket) in self.buckets_for(principal_id, credential_id) {
            if !bucket.allow() {
                return RateLimitDecision {
                    allowed: false,
                    rejected_by: vec![tier],
                    retry_after: bucket.time_until_available(),
                };
            }
        }
        RateLimitDecision::allowed()
    }

    fn evaluate_all(&self, principal_id: &str, credential_id: Option<&str>) -> RateLimitDecision {
        let mut taken = Vec::new();
        let mut decision = RateLimitDecision::allowed();

        for (tier, bucket) in self.buckets_for(principal_id, credential_id) {
            if bucket.allow() {
                taken.push(bucket);
            } else {
                if decision.rejected_by.is_empty() {
                    decision.retry_after = bucket.time_until_available();
                }
                decision.allowed = false;
                decision.rejected_by.push(tier);
            }
        }

        // Tokens are only spent by requests that are actually admitted.
        if !decision.allowed {
            for bucket in taken {
                bucket.refund(1.0);
            }
        }
        decision
    }

    /// Buckets to consult, in evaluation order. Lazy, so per-key buckets
    /// behind a denying tier are never created in short-circuit mode.
    fn buckets_for<'a>(
        &'a self,
        principal_id: &'a str,
        credential_id: Option<&'a str>,
    ) -> impl Iterator<Item = (RateLimitTier, BucketRef<'a>)> + 'a {
        [
            RateLimitTier::Global,
            RateLimitTier::Principal,
            RateLimitTier::Credential,
        ]
        .into_iter()
        .filter_map(move |tier| {
            let bucket = match tier {
                RateLimitTier::Global => self.global.as_ref().map(BucketRef::Borrowed),
                RateLimitTier::Principal => self
                    .principals
                    .as_ref()
                    .map(|t| BucketRef::Shared(t.bucket(principal_id))),
                RateLimitTier::Credential => self
                    .credentials
                    .as_ref()
                    .zip(credential_id)
                    .map(|(t, id)| BucketRef::Shared(t.bucket(id))),
            };
            bucket.map(|b| (tier, b))
        })
    }

    fn rejection_counter(&self, tier: RateLimitTier) -> &AtomicU64 {
        match tier {
            RateLimitTier::Global => &self.counters.rejected_global,
            RateLimitTier::Principal => &self.counters.rejected_principal,
            RateLimitTier::Credential => &self.counters.rejected_credential,
        }
    }

    /// Drop per-key buckets idle longer than the configured TTL.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep_idle(&self) -> usize {
        let idle_ttl = self.config.idle_ttl();
        let removed = self.principals.as_ref().map_or(0, |t| t.sweep(idle_ttl))
            + self.credentials.as_ref().map_or(0, |t| t.sweep(idle_ttl));
        if removed > 0 {
            debug!(removed, "swept idle rate-limit buckets");
        }
        removed
    }

    /// Number of per-key buckets currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.principals.as_ref().map_or(0, KeyedTier::len)
            + self.credentials.as_ref().map_or(0, KeyedTier::len)
    }

    /// Snapshot of limiter counters.
    #[must_use]
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            total_checked: self.counters.checked.load(Ordering::Relaxed),
            total_allowed: self.counters.allowed.load(Ordering::Relaxed),
            rejected_global: self.counters.rejected_global.load(Ordering::Relaxed),
            rejected_principal: self.counters.rejected_principal.load(Ordering::Relaxed),
            rejected_credential: self.counters.rejected_credential.load(Ordering::Relaxed),
            tracked_principals: self.principals.as_ref().map_or(0, KeyedTier::len),
            tracked_credentials: self.credentials.as_ref().map_or(0, KeyedTier::len),
            global_tokens: self.global.as_ref().map(TokenBucket::tokens),
        }
    }

    /// Refill the global bucket and forget every per-key bucket.
    pub fn reset(&self) {
        if let Some(global) = &self.global {
            global.reset();
        }
        if let Some(tier) = &self.principals {
            tier.clear();
        }
        if let Some(tier) = &self.credentials {
            tier.clear();
        }
    }
}

impl fmt::Debug for TieredRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredRateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.tracked_keys())
            .finish_non_exhaustive()
    }
}

enum BucketRef<'a> {
    Borrowed(&'a TokenBucket),
    Shared(Arc<TokenBucket>),
}

impl std::ops::Deref for BucketRef<'_> {
    type Target = TokenBucket;

    fn deref(&self) -> &TokenBucket {
        match self {
            Self::Borrowed(b) => b,
            Self::Shared(b) => b,
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    /// Admission checks performed.
    pub total_checked: u64,
    /// Checks that were admitted.
    pub total_allowed: u64,
    /// Rejections attributed to the global tier.
    pub rejected_global: u64,
    /// Rejections attributed to the principal tier.
    pub rejected_principal: u64,
    /// Rejections attributed to the credential tier.
    pub rejected_credential: u64,
    /// Principal buckets currently tracked.
    pub tracked_principals: usize,
    /// Credential buckets currently tracked.
    pub tracked_credentials: usize,
    /// Tokens left in the global bucket, if that tier is configured.
    pub global_tokens: Option<f64>,
}

impl RateLimitStats {
    /// Fraction of checks that were rejected.
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_checked == 0 {
            0.0
        } else {
            (self.total_checked - self.total_allowed) as f64 / self.total_checked as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimitConfig) -> TieredRateLimiter {
        TieredRateLimiter::new(config)
    }

    #[test]
    fn test_no_tiers_admits_everything() {
        let limiter = limiter(RateLimitConfig::default());
        for _ in 0..1000 {
            assert!(limiter.allow("anyone", Some("key")).allowed);
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_tier_scenario() {
        let limiter = limiter(RateLimitConfig::default().with_global(TierLimit::new(60.0, 10.0)));

        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..70 {
            let decision = limiter.allow("principal-1", None);
            if decision.allowed {
                admitted += 1;
            } else {
                assert_eq!(decision.reason(), Some("global"));
                rejected += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(rejected, 60);

        let stats = limiter.stats();
        assert_eq!(stats.rejected_global, 60);
        assert_eq!(stats.total_allowed, 10);
    }

    #[test]
    fn test_short_circuit_reports_first_tier() {
        let limiter = limiter(
            RateLimitConfig::default()
                .with_global(TierLimit::new(60.0, 1.0))
                .with_per_principal(TierLimit::new(60.0, 1.0)),
        );
        assert!(limiter.allow("a", None).allowed);

        let decision = limiter.allow("a", None);
        assert_eq!(decision.rejected_by, vec![RateLimitTier::Global]);
        assert_eq!(limiter.stats().rejected_principal, 0);

        // A new principal denied at the global tier never gets a bucket.
        assert!(!limiter.allow("b", None).allowed);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_credential_tier_only_applies_with_credential() {
        let limiter = limiter(RateLimitConfig::default().with_per_credential(TierLimit::new(60.0, 1.0)));
        assert!(limiter.allow("a", Some("key-1")).allowed);
        assert_eq!(limiter.allow("a", Some("key-1")).reason(), Some("credential"));
        assert!(limiter.allow("a", Some("key-2")).allowed);
        assert!(limiter.allow("a", None).allowed);
    }

    #[test]
    fn test_all_tiers_reports_every_violation() {
        let limiter = limiter(
            RateLimitConfig::default()
                .with_global(TierLimit::new(60.0, 1.0))
                .with_per_principal(TierLimit::new(60.0, 1.0))
                .with_evaluation(TierEvaluation::AllTiers),
        );
        assert!(limiter.allow("a", None).allowed);
        let decision = limiter.allow("a", None);
        assert_eq!(
            decision.rejected_by,
            vec![RateLimitTier::Global, RateLimitTier::Principal]
        );
    }

    #[test]
    fn test_all_tiers_refunds_passing_tiers() {
        let limiter = limiter(
            RateLimitConfig::default()
                .with_global(TierLimit::new(0.001, 5.0))
                .with_per_principal(TierLimit::new(0.001, 1.0))
                .with_evaluation(TierEvaluation::AllTiers),
        );
        assert!(limiter.allow("a", None).allowed);
        for _ in 0..3 {
            assert_eq!(limiter.allow("a", None).reason(), Some("principal"));
        }
        // Rejected requests did not drain the global bucket.
        let tokens = limiter.stats().global_tokens.unwrap();
        assert!(tokens >= 4.0 && tokens < 4.01, "global tokens: {tokens}");
    }

    #[test]
    fn test_check_returns_typed_error() {
        let limiter = limiter(RateLimitConfig::default().with_per_principal(TierLimit::new(60.0, 0.0)));
        match limiter.check("a", None) {
            Err(AdmissionError::RateLimitExceeded { tier, retry_after }) => {
                assert_eq!(tier, RateLimitTier::Principal);
                assert_eq!(retry_after, None);
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buckets_are_swept() {
        let limiter = limiter(
            RateLimitConfig::default()
                .with_per_principal(TierLimit::new(60.0, 5.0))
                .with_per_credential(TierLimit::new(60.0, 5.0))
                .with_idle_ttl(Duration::from_secs(3600)),
        );
        assert!(limiter.allow("stale", Some("stale-key")).allowed);
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert!(limiter.allow("fresh", None).allowed);
        assert_eq!(limiter.tracked_keys(), 3);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(limiter.sweep_idle(), 2);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_reset_forgets_keys() {
        let limiter = limiter(
            RateLimitConfig::default()
                .with_global(TierLimit::new(60.0, 1.0))
                .with_per_principal(TierLimit::new(60.0, 1.0)),
        );
        assert!(limiter.allow("a", None).allowed);
        assert!(!limiter.allow("a", None).allowed);
        limiter.reset();
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.allow("a", None).allowed);
    }

    #[test]
    fn test_rejection_rate() {
        let stats = RateLimitStats {
            total_checked: 100,
            total_allowed: 75,
            rejected_global: 25,
            rejected_principal: 0,
            rejected_credential: 0,
            tracked_principals: 0,
            tracked_credentials: 0,
            global_tokens: None,
        };
        assert!((stats.rejection_rate() - 0.25).abs() < f64::EPSILON);
    }
}
