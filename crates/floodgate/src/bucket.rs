//! Token bucket with continuous refill.
//!
//! The bucket starts full. Every admission first credits the tokens earned
//! since the last refill (capped at capacity), then takes one token if a
//! whole token is available. Refill and take happen under the bucket's own
//! lock so concurrent callers never lose updates.
//!
//! # Example
//!
//! ```rust
//! use floodgate::TokenBucket;
//!
//! // 10 requests of burst, refilled at 1 per second
//! let bucket = TokenBucket::new(10.0, 1.0);
//!
//! for _ in 0..10 {
//!     assert!(bucket.allow());
//! }
//! assert!(!bucket.allow());
//! ```

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// A rate-limiting token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// `capacity` is clamped to be non-negative.
    #[must_use]
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Self {
        let capacity = capacity.max(0.0);
        let now = Instant::now();
        Self {
            capacity,
            refill_rate_per_second,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                last_used: now,
            }),
        }
    }

    /// Maximum burst size.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens credited per second.
    #[must_use]
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.try_acquire(1.0)
    }

    /// Take `amount` tokens if that many are available.
    ///
    /// Either all of `amount` is taken or nothing is.
    pub fn try_acquire(&self, amount: f64) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        self.refill(&mut state, now);
        state.last_used = now;

        if state.tokens >= amount {
            state.tokens = (state.tokens - amount).max(0.0);
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after crediting elapsed time.
    #[must_use]
    pub fn tokens(&self) -> f64 {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// How long until one whole token is available.
    ///
    /// Returns `None` when the bucket can never admit (zero capacity).
    #[must_use]
    pub fn time_until_available(&self) -> Option<Duration> {
        if self.capacity < 1.0 || self.refill_rate_per_second <= 0.0 {
            return None;
        }
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        let missing = 1.0 - state.tokens;
        if missing <= 0.0 {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_secs_f64(missing / self.refill_rate_per_second))
        }
    }

    /// Time since the bucket was last asked to admit.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last_used)
    }

    /// Refill the bucket to capacity.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.tokens = self.capacity;
        state.last_refill = now;
    }

    /// Return tokens taken by an admission that was later abandoned.
    pub(crate) fn refund(&self, amount: f64) {
        let mut state = self.lock();
        state.tokens = (state.tokens + amount).min(self.capacity);
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let earned = elapsed.as_secs_f64() * self.refill_rate_per_second;
        state.tokens = (state.tokens + earned).min(self.capacity);
        state.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // The state is plain numbers; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
