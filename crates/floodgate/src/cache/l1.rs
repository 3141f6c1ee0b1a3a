//! Bounded in-process (L1) cache.
//!
//! When full, the entry inserted longest ago is evicted. Overwriting a key
//! counts as a fresh insertion. Insertion order is tracked in a queue of
//! `(key, sequence)` pairs; pairs whose sequence no longer matches the live
//! entry are skipped on eviction and dropped when the queue is compacted.

use super::expiry_after;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<(String, u64)>,
    next_seq: u64,
}

/// Capacity-bounded map with per-entry TTL.
#[derive(Debug)]
pub(crate) struct LocalCache {
    max_entries: usize,
    inner: Mutex<Inner>,
}

impl LocalCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn insert(&self, key: &str, value: Bytes, ttl: Duration) {
        let expires_at = expiry_after(Instant::now(), ttl);
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let replaced = inner
            .entries
            .insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at,
                    seq,
                },
            )
            .is_some();
        inner.order.push_back((key.to_string(), seq));

        if !replaced {
            while inner.entries.len() > self.max_entries {
                if !Self::evict_oldest(&mut inner) {
                    break;
                }
            }
        }
        if inner.order.len() > self.max_entries.saturating_mul(2) {
            Self::compact(&mut inner);
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub(crate) fn remove_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        before - inner.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn evict_oldest(inner: &mut Inner) -> bool {
        while let Some((key, seq)) = inner.order.pop_front() {
            if inner.entries.get(&key).is_some_and(|e| e.seq == seq) {
                inner.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn compact(inner: &mut Inner) {
        let Inner { entries, order, .. } = inner;
        order.retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_evicts_oldest_insertion() {
        let cache = LocalCache::new(2);
        cache.insert("a", bytes("1"), TTL);
        cache.insert("b", bytes("2"), TTL);
        // Reads do not refresh insertion order.
        assert!(cache.get("a").is_some());
        cache.insert("c", bytes("3"), TTL);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(bytes("2")));
        assert_eq!(cache.get("c"), Some(bytes("3")));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_counts_as_fresh_insertion() {
        let cache = LocalCache::new(2);
        cache.insert("a", bytes("1"), TTL);
        cache.insert("b", bytes("2"), TTL);
        cache.insert("a", bytes("1b"), TTL);
        cache.insert("c", bytes("3"), TTL);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(bytes("1b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = LocalCache::new(4);
        cache.insert("a", bytes("1"), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("a").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_does_not_overflow() {
        let cache = LocalCache::new(4);
        cache.insert("a", bytes("1"), Duration::MAX);
        assert_eq!(cache.get("a"), Some(bytes("1")));
    }

    #[tokio::test]
    async fn test_order_queue_stays_bounded() {
        let cache = LocalCache::new(4);
        for _ in 0..1_000 {
            cache.insert("hot", bytes("x"), TTL);
        }
        assert!(cache.lock().order.len() <= 8);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_prefix() {
        let cache = LocalCache::new(8);
        cache.insert("user:1", bytes("a"), TTL);
        cache.insert("user:2", bytes("b"), TTL);
        cache.insert("team:1", bytes("c"), TTL);
        assert_eq!(cache.remove_prefix("user:"), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
