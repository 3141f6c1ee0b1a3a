//! Remote (L2) cache stores.

use super::expiry_after;
use crate::error::CacheError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A shared key-value store with per-entry expiry.
///
/// Implementations must be safe to call from many tasks at once. Errors are
/// reported, never panicked; the tiered cache turns them into misses.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch a live value together with its remaining lifetime.
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, CacheError>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove one batch of keys starting with `prefix`.
    ///
    /// Start with `cursor` 0 and pass each returned
    /// [`next_cursor`](PrefixBatch::next_cursor) back in. A returned cursor of
    /// 0 means the scan is complete.
    async fn delete_prefix_batch(&self, prefix: &str, cursor: u64)
    -> Result<PrefixBatch, CacheError>;

    /// Remove every key starting with `prefix` and return how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let batch = self.delete_prefix_batch(prefix, cursor).await?;
            removed += batch.removed;
            if batch.is_last() {
                return Ok(removed);
            }
            cursor = batch.next_cursor;
        }
    }
}

/// A value read from a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// The stored payload.
    pub value: Bytes,
    /// Time left before the store expires the entry. `None` if it never does.
    pub ttl: Option<Duration>,
}

impl RemoteEntry {
    /// An entry that expires after `ttl`.
    #[must_use]
    pub fn expiring(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            ttl: Some(ttl),
        }
    }

    /// An entry with no expiry.
    #[must_use]
    pub fn persistent(value: Bytes) -> Self {
        Self { value, ttl: None }
    }
}

/// Progress of an incremental prefix deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixBatch {
    /// Cursor for the next batch; 0 once the scan is complete.
    pub next_cursor: u64,
    /// Keys removed by this batch.
    pub removed: u64,
}

impl PrefixBatch {
    /// Whether this was the final batch.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next_cursor == 0
    }
}

/// A store that holds nothing.
///
/// Used when no remote tier is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRemoteStore;

#[async_trait]
impl RemoteStore for NoopRemoteStore {
    async fn get(&self, _key: &str) -> Result<Option<RemoteEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete_prefix_batch(
        &self,
        _prefix: &str,
        _cursor: u64,
    ) -> Result<PrefixBatch, CacheError> {
        Ok(PrefixBatch::default())
    }
}

/// In-process stand-in for a shared store.
///
/// Expiry follows the tokio clock, so paused-time tests can step past TTLs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until they are touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Bytes, Instant)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(RemoteEntry::expiring(
                value.clone(),
                *expires_at - now,
            ))),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry_after(Instant::now(), ttl);
        self.lock().insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    /// Removes every matching key in a single batch.
    async fn delete_prefix_batch(
        &self,
        prefix: &str,
        _cursor: u64,
    ) -> Result<PrefixBatch, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut removed = 0;
        entries.retain(|key, (_, expires_at)| {
            if key.starts_with(prefix) {
                if *expires_at > now {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(PrefixBatch {
            next_cursor: 0,
            removed,
        })
    }
}
