//! Remote store with fault injection.

use async_trait::async_trait;
use bytes::Bytes;
use floodgate::cache::{MemoryStore, PrefixBatch, RemoteEntry, RemoteStore};
use floodgate::error::CacheError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Wraps a [`RemoteStore`] and lets tests break it on demand.
///
/// While unavailable every call fails with [`CacheError::Unavailable`]. A
/// configured latency is applied before every call, which lets tests drive
/// the cache's remote timeout.
#[derive(Debug, Default)]
pub struct FlakyStore<S = MemoryStore> {
    inner: S,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl<S: RemoteStore> FlakyStore<S> {
    /// Wrap `inner`, initially healthy and with no added latency.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Make every call fail (`true`) or pass through (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls received, including failed ones.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that failed because of an injected outage.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn before_call(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(CacheError::unavailable("injected outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RemoteStore> RemoteStore for FlakyStore<S> {
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, CacheError> {
        self.before_call().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.before_call().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.before_call().await?;
        self.inner.delete(key).await
    }

    async fn delete_prefix_batch(
        &self,
        prefix: &str,
        cursor: u64,
    ) -> Result<PrefixBatch, CacheError> {
        self.before_call().await?;
        self.inner.delete_prefix_batch(prefix, cursor).await
    }
}
