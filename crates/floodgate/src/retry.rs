//! Retry with exponential backoff.
//!
//! The delay before retry `n` (1-indexed) is `min(max_delay, base_delay * 2^(n-1))`,
//! optionally scaled by a random jitter factor. Only errors the caller's
//! classifier marks as retryable are retried; anything else is returned
//! immediately as [`FloodgateError::Operation`].
//!
//! # Example
//!
//! ```rust
//! use floodgate::retry::{Jitter, RetryPolicy};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1))
//!     .with_jitter(Jitter::None);
//!
//! let result = policy
//!     .run(
//!         || async { Ok::<_, std::io::Error>("done") },
//!         |_err| true,
//!         &CancellationToken::new(),
//!     )
//!     .await;
//! assert_eq!(result.unwrap(), "done");
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::FloodgateError;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Randomization applied to backoff delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Multiply each delay by a random factor in `[0.5, 1.0]`.
    Uniform,
    /// Use the exact computed delay.
    None,
    /// Multiply each delay by a fixed factor, clamped to `[0.0, 1.0]`.
    Fixed(f64),
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::Uniform => delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0)),
            Self::None => delay,
            Self::Fixed(factor) => delay.mul_f64(factor.clamp(0.0, 1.0)),
        }
    }
}

/// How a guarded call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    attempt_timeout: Option<Duration>,
    overall_timeout: Option<Duration>,
    jitter: Jitter,
}

impl RetryPolicy {
    /// Create a policy with uniform jitter and no timeouts.
    ///
    /// `max_attempts` counts the first attempt and is raised to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            attempt_timeout: None,
            overall_timeout: None,
            jitter: Jitter::Uniform,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policy = Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        );
        policy.attempt_timeout = config.attempt_timeout_ms.map(Duration::from_millis);
        policy.overall_timeout = config.overall_timeout_ms.map(Duration::from_millis);
        policy
    }

    /// Set the jitter mode.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound every individual attempt.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Bound the whole loop, backoff waits included.
    #[must_use]
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    /// Total attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before retry `retry` (1-indexed).
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry `retry` with jitter applied.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.jitter.apply(self.backoff_delay(retry))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts, passes the overall deadline, or `cancel` fires.
    ///
    /// A per-attempt timeout counts as a retryable failure. When the last
    /// attempt fails the error carries the attempt count and, for operation
    /// errors, the final underlying cause.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        mut op: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<T, FloodgateError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let started = Instant::now();
        let deadline = self.overall_timeout.and_then(|t| started.checked_add(t));
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FloodgateError::Cancelled),
                () = wait_until(deadline) => {
                    return Err(FloodgateError::DeadlineExceeded { elapsed: started.elapsed() });
                }
                outcome = self.attempt(&mut op) => outcome,
            };

            let last_error = match outcome {
                Some(Ok(value)) => return Ok(value),
                Some(Err(err)) if !classify(&err) => {
                    debug!(attempt, error = %err, "non-retryable error, giving up");
                    return Err(FloodgateError::Operation(err));
                }
                Some(Err(err)) => Some(err),
                None => None,
            };

            if attempt >= self.max_attempts {
                return Err(match last_error {
                    Some(source) => FloodgateError::RetryExhausted {
                        attempts: attempt,
                        source,
                    },
                    None => FloodgateError::AttemptTimeout {
                        attempts: attempt,
                        timeout: self.attempt_timeout.unwrap_or_default(),
                    },
                });
            }

            let delay = self.delay_for_retry(attempt);
            match &last_error {
                Some(err) => warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                ),
                None => warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "attempt timed out, retrying"
                ),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FloodgateError::Cancelled),
                () = wait_until(deadline) => {
                    return Err(FloodgateError::DeadlineExceeded { elapsed: started.elapsed() });
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// `None` when the attempt timed out.
    async fn attempt<T, E, F, Fut>(&self, op: &mut F) -> Option<Result<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.attempt_timeout {
            Some(timeout) => tokio::time::timeout(timeout, op()).await.ok(),
            None => Some(op().await),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
