//! Redis remote cache tier for floodgate.
//!
//! [`RedisStore`] implements [`RemoteStore`] over a multiplexed async
//! connection, so one store can be shared by every task in the process.
//!
//! - Values are stored as raw bytes with a millisecond expiry (`PSETEX`) and
//!   read back together with their remaining lifetime (`PTTL`).
//! - Keys can be namespaced so several services share one Redis database.
//! - Prefix invalidation walks the key space with `SCAN`, one cursor step
//!   per batch, and removes each batch with `UNLINK`; it never blocks Redis
//!   with `KEYS`.
//!
//! # Example
//!
//! ```rust,no_run
//! use floodgate::{ResilienceConfig, ServiceContext};
//! use floodgate_redis::RedisStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::connect("redis://127.0.0.1/")
//!     .await?
//!     .with_namespace("orders-service");
//! let context = ServiceContext::new(ResilienceConfig::default(), Arc::new(store))?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

use async_trait::async_trait;
use bytes::Bytes;
use floodgate::cache::{PrefixBatch, RemoteEntry, RemoteStore};
use floodgate::error::CacheError;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Keys requested per `SCAN` round trip.
pub const DEFAULT_SCAN_BATCH: usize = 500;

/// A [`RemoteStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    namespace: Option<String>,
    scan_batch: usize,
}

impl RedisStore {
    /// Open a multiplexed connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection.
    #[must_use]
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            namespace: None,
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    /// Prefix every key with `namespace:`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the `COUNT` hint used when scanning for prefix invalidation.
    #[must_use]
    pub fn with_scan_batch(mut self, batch: usize) -> Self {
        self.scan_batch = batch.max(1);
        self
    }

    fn key(&self, key: &str) -> String {
        namespaced(self.namespace.as_deref(), key)
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .field("scan_batch", &self.scan_batch)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteEntry>, CacheError> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(value.map(|value| RemoteEntry {
            value: Bytes::from(value),
            ttl: remaining_ttl(pttl),
        }))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.connection.clone();
        let _: () = conn
            .pset_ex(self.key(key), value.as_ref(), millis)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: u64 = conn.del(self.key(key)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete_prefix_batch(
        &self,
        prefix: &str,
        cursor: u64,
    ) -> Result<PrefixBatch, CacheError> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut conn = self.connection.clone();

        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(self.scan_batch)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let removed = if keys.is_empty() {
            0
        } else {
            conn.unlink(&keys).await.map_err(unavailable)?
        };

        debug!(prefix, cursor, next_cursor, removed, "unlinked remote batch");
        Ok(PrefixBatch {
            next_cursor,
            removed,
        })
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::unavailable(err.to_string())
}

/// Map a `PTTL` reply to a remaining lifetime.
///
/// `-1` means the key has no expiry; `-2` means it vanished between the
/// `GET` and the `PTTL`, which reads as already expired.
fn remaining_ttl(pttl: i64) -> Option<Duration> {
    match pttl {
        -1 => None,
        ms => Some(Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
    }
}

fn namespaced(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{key}"),
        None => key.to_string(),
    }
}

/// Escape the characters `SCAN MATCH` treats as glob syntax.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
