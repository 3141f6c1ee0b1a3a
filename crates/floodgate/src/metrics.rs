//! Aggregated counters for export.
//!
//! Every component keeps its own atomic counters; a [`ResilienceSnapshot`]
//! reads them all at one point in time. Snapshots are plain data and
//! serialize with serde, so they can be written to logs or served from a
//! status endpoint.

use crate::breaker::{CircuitSnapshot, CircuitState};
use crate::cache::CacheStats;
use crate::limiter::RateLimitStats;
use crate::queue::QueueStats;
use serde::Serialize;

/// Counters of every component owned by a [`ServiceContext`](crate::ServiceContext).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceSnapshot {
    /// Rate limiter counters.
    pub rate_limit: RateLimitStats,
    /// One entry per guarded dependency, sorted by name.
    pub circuits: Vec<CircuitSnapshot>,
    /// In-flight queue counters.
    pub queue: QueueStats,
    /// Cache counters.
    pub cache: CacheStats,
}

impl ResilienceSnapshot {
    /// Look up the snapshot of one dependency's breaker.
    #[must_use]
    pub fn circuit(&self, dependency: &str) -> Option<&CircuitSnapshot> {
        self.circuits.iter().find(|c| c.dependency == dependency)
    }

    /// Dependencies whose circuit is currently in `state`.
    #[must_use]
    pub fn circuits_in(&self, state: CircuitState) -> Vec<&str> {
        self.circuits
            .iter()
            .filter(|c| c.state == state)
            .map(|c| c.dependency.as_str())
            .collect()
    }

    /// Requests shed by the rate limiter or the queue.
    #[must_use]
    pub fn shed(&self) -> u64 {
        self.rate_limit
            .total_checked
            .saturating_sub(self.rate_limit.total_allowed)
            + self.queue.rejected
    }
}
