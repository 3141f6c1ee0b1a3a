//! Two-tier cache: a bounded in-process map in front of a shared store.
//!
//! Reads try L1 first, then L2; an L2 hit is copied into L1 for no longer
//! than the entry has left in L2. Writes go to both tiers. Every L2 call is
//! bounded by the configured timeout, and any L2 error or timeout is logged
//! and treated as a miss, so a broken remote store slows nothing down beyond
//! that timeout and never fails a request. Prefix invalidation runs in
//! batches and the timeout applies to each batch.
//!
//! # Example
//!
//! ```rust
//! use floodgate::cache::{MemoryStore, TieredCache};
//! use floodgate::config::CacheConfig;
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let cache = TieredCache::new(CacheConfig::default(), Arc::new(MemoryStore::new()));
//! cache.set("user:42", Bytes::from_static(b"{}"), Duration::from_secs(30)).await;
//! assert!(cache.get("user:42").await.is_some());
//! # }
//! ```

mod l1;
mod remote;

pub use remote::{MemoryStore, NoopRemoteStore, PrefixBatch, RemoteEntry, RemoteStore};

use crate::config::CacheConfig;
use crate::error::CacheError;
use bytes::Bytes;
use l1::LocalCache;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stand-in expiry for TTLs too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, saturating at [`FAR_FUTURE`] instead of overflowing.
pub(crate) fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
}

/// L1 + L2 cache with graceful L2 degradation.
pub struct TieredCache {
    config: CacheConfig,
    l1: LocalCache,
    l2: Arc<dyn RemoteStore>,
    counters: CacheCounters,
}

impl TieredCache {
    /// Create a cache over `remote`.
    #[must_use]
    pub fn new(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            l1: LocalCache::new(config.l1_max_entries),
            l2: remote,
            config,
            counters: CacheCounters::default(),
        }
    }

    /// Create a cache with no remote tier.
    #[must_use]
    pub fn local_only(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(NoopRemoteStore))
    }

    /// The cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look `key` up in L1, then L2.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.l1.get(key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        self.counters.l1_misses.fetch_add(1, Ordering::Relaxed);

        match self.remote("get", key, self.l2.get(key)).await {
            Some(Some(entry)) => {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                let l1_ttl = self.config.l1_ttl_duration();
                let ttl = entry.ttl.map_or(l1_ttl, |remaining| remaining.min(l1_ttl));
                if !ttl.is_zero() {
                    self.l1.insert(key, entry.value.clone(), ttl);
                }
                Some(entry.value)
            }
            Some(None) => {
                self.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    /// Store `value` in both tiers for `ttl`.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        self.l1.insert(key, value.clone(), ttl);
        self.remote("set", key, self.l2.set(key, value, ttl)).await;
    }

    /// Store `value` using each tier's configured TTL.
    pub async fn set_default(&self, key: &str, value: Bytes) {
        self.l1
            .insert(key, value.clone(), self.config.l1_ttl_duration());
        self.remote(
            "set",
            key,
            self.l2.set(key, value, self.config.l2_ttl_duration()),
        )
        .await;
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) {
        self.l1.remove(key);
        self.remote("delete", key, self.l2.delete(key)).await;
    }

    /// Remove every key starting with `prefix` from both tiers.
    ///
    /// L2 is scanned batch by batch, each batch under the remote timeout.
    /// Returns the number of L2 entries removed, or `None` if a batch failed.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Option<u64> {
        self.l1.remove_prefix(prefix);

        let mut cursor = 0;
        let mut removed = 0;
        let outcome = loop {
            let batch = self
                .remote(
                    "delete_prefix",
                    prefix,
                    self.l2.delete_prefix_batch(prefix, cursor),
                )
                .await;
            match batch {
                Some(batch) => {
                    removed += batch.removed;
                    if batch.is_last() {
                        break Some(removed);
                    }
                    cursor = batch.next_cursor;
                }
                None => break None,
            }
        };

        // Reads racing the scan may have refilled L1 from keys not yet removed.
        self.l1.remove_prefix(prefix);
        debug!(prefix, removed, complete = outcome.is_some(), "invalidated prefix");
        outcome
    }

    /// Drop everything held in L1.
    pub fn clear_local(&self) {
        self.l1.clear();
    }

    /// Hit and miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.counters.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.counters.l2_misses.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            l1_entries: self.l1.len(),
        }
    }

    /// Run an L2 call under the timeout. `None` means it failed.
    async fn remote<T>(
        &self,
        operation: &'static str,
        key: &str,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        let timeout = self.config.l2_timeout_duration();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout { operation, timeout }),
        };
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                warn!(operation, key, error = %err, "remote cache degraded, treating as miss");
                None
            }
        }
    }
}

impl fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.config)
            .field("l1_entries", &self.l1.len())
            .finish_non_exhaustive()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads served by L1.
    pub l1_hits: u64,
    /// Reads that missed L1.
    pub l1_misses: u64,
    /// L1 misses served by L2.
    pub l2_hits: u64,
    /// L1 misses that L2 also missed.
    pub l2_misses: u64,
    /// L2 calls that failed or timed out.
    pub l2_errors: u64,
    /// Entries currently in L1.
    pub l1_entries: usize,
}

impl CacheStats {
    /// Fraction of reads served from either tier.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.l1_hits + self.l1_misses;
        if reads == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits) as f64 / reads as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct StalledStore;

    #[async_trait]
    impl RemoteStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<RemoteEntry>, CacheError> {
            std::future::pending().await
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            std::future::pending().await
        }
        async fn delete_prefix_batch(
            &self,
            _prefix: &str,
            _cursor: u64,
        ) -> Result<PrefixBatch, CacheError> {
            std::future::pending().await
        }
    }

    /// Removes one matching key per batch, slowly.
    #[derive(Default)]
    struct SlowScanStore {
        entries: Mutex<BTreeMap<String, Bytes>>,
    }

    #[async_trait]
    impl RemoteStore for SlowScanStore {
        async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, CacheError> {
            let entries = self.entries.lock().unwrap();
            Ok(entries.get(key).cloned().map(RemoteEntry::persistent))
        }
        async fn set(&self, key: &str, value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
        async fn delete_prefix_batch(
            &self,
            prefix: &str,
            cursor: u64,
        ) -> Result<PrefixBatch, CacheError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut entries = self.entries.lock().unwrap();
            let next = entries.keys().find(|k| k.starts_with(prefix)).cloned();
            let removed = u64::from(next.is_some_and(|k| entries.remove(&k).is_some()));
            let more = entries.keys().any(|k| k.starts_with(prefix));
            Ok(PrefixBatch {
                next_cursor: if more { cursor + 1 } else { 0 },
                removed,
            })
        }
    }

    fn config() -> CacheConfig {
        CacheConfig::default()
            .l1_max_entries(16)
            .l1_ttl(Duration::from_secs(10))
            .l2_ttl(Duration::from_secs(100))
            .l2_timeout(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_hit_populates_l1() {
        let remote = Arc::new(MemoryStore::new());
        remote
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(100))
            .await
            .unwrap();
        let cache = TieredCache::new(config(), remote);

        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));

        let stats = cache.stats();
        assert_eq!(stats.l1_misses, 1);
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l1_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_respects_ttl_across_tiers() {
        let cache = TieredCache::new(config(), Arc::new(MemoryStore::new()));
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_default_uses_tier_ttls() {
        let cache = TieredCache::new(config(), Arc::new(MemoryStore::new()));
        cache.set_default("k", Bytes::from_static(b"v")).await;

        // L1 expires after 10s but L2 still holds the value.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").await.is_some());
        assert_eq!(cache.stats().l2_hits, 1);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_remote_degrades_to_miss() {
        let cache = TieredCache::new(config(), Arc::new(StalledStore));

        let started = tokio::time::Instant::now();
        assert_eq!(cache.get("k").await, None);
        assert_eq!(started.elapsed(), Duration::from_millis(50));

        // Writes still land in L1.
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await;
        assert!(cache.get("k").await.is_some());
        assert_eq!(cache.stats().l2_errors, 2);
    }

    #[tokio::test]
    async fn test_delete_and_invalidate_prefix() {
        let cache = TieredCache::new(config(), Arc::new(MemoryStore::new()));
        for key in ["user:1", "user:2", "team:1"] {
            cache
                .set(key, Bytes::from_static(b"x"), Duration::from_secs(60))
                .await;
        }
        cache.delete("team:1").await;
        assert_eq!(cache.get("team:1").await, None);

        assert_eq!(cache.invalidate_prefix("user:").await, Some(2));
        assert_eq!(cache.get("user:1").await, None);
        assert_eq!(cache.stats().l1_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_refill_keeps_original_expiry() {
        let cache = TieredCache::new(config().l1_max_entries(1), Arc::new(MemoryStore::new()));
        cache
            .set("a", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await;
        // Evicts "a" from L1.
        cache
            .set("b", Bytes::from_static(b"w"), Duration::from_secs(60))
            .await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"v")));
        assert_eq!(cache.stats().l2_hits, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_refill_after_clear_local_keeps_original_expiry() {
        let cache = TieredCache::new(config(), Arc::new(MemoryStore::new()));
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(3))
            .await;
        cache.clear_local();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_times_out_per_batch() {
        let remote = Arc::new(SlowScanStore::default());
        let cache = TieredCache::new(config(), remote.clone());
        for i in 0..10 {
            cache
                .set(&format!("user:{i}"), Bytes::from_static(b"x"), Duration::from_secs(60))
                .await;
        }
        cache
            .set("team:1", Bytes::from_static(b"y"), Duration::from_secs(60))
            .await;

        // Ten 20ms batches take far longer than the 50ms remote timeout.
        assert_eq!(cache.invalidate_prefix("user:").await, Some(10));
        for i in 0..10 {
            assert_eq!(cache.get(&format!("user:{i}")).await, None);
        }
        assert!(cache.get("team:1").await.is_some());
        assert_eq!(cache.stats().l2_errors, 0);
    }

    #[tokio::test]
    async fn test_validated_huge_ttls_do_not_panic() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"l1_ttl_secs": 18446744073709551615, "l2_ttl_secs": 18446744073709551615}"#)
                .unwrap();
        assert!(config.validate().is_ok());

        let cache = TieredCache::new(config, Arc::new(MemoryStore::new()));
        cache.set_default("k", Bytes::from_static(b"v")).await;
        cache.set("j", Bytes::from_static(b"w"), Duration::MAX).await;
        assert!(cache.get("k").await.is_some());
        assert!(cache.get("j").await.is_some());
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            l1_hits: 6,
            l1_misses: 4,
            l2_hits: 2,
            ..CacheStats::default()
        };
        assert!((stats.hit_ratio() - 0.8).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
