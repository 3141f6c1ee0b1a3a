//! Error types for the resilience layer.
//!
//! Errors fall into three groups:
//!
//! - [`AdmissionError`]: the request was shed before any work happened
//!   (rate limit, full queue, enqueue timeout). These are terminal for the
//!   current request and are never retried by this crate.
//! - [`FloodgateError`]: the outcome of a guarded call, generic over the
//!   operation's own error type so callers can still match on the final
//!   underlying cause.
//! - [`CacheError`]: remote cache failures. These never leave the cache tier;
//!   [`TieredCache`](crate::cache::TieredCache) downgrades them to misses.

use crate::limiter::RateLimitTier;
use std::time::Duration;
use thiserror::Error;

/// A request was rejected before it reached the guarded operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// A rate-limit tier denied the request.
    #[error("Rate limit exceeded at {tier} tier{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimitExceeded {
        /// The tier that rejected the request.
        tier: RateLimitTier,
        /// Suggested delay before the tier will admit again.
        retry_after: Option<Duration>,
    },

    /// The backpressure queue was at capacity and no wait was requested.
    #[error("Queue full (max depth: {max_depth})")]
    QueueFull {
        /// Configured queue capacity.
        max_depth: usize,
    },

    /// No queue slot became free within the enqueue timeout.
    #[error("Enqueue timed out after {waited:?}")]
    EnqueueTimeout {
        /// How long the admission call waited.
        waited: Duration,
    },

    /// The queue has been closed and accepts no more work.
    #[error("Queue closed")]
    QueueClosed,

    /// The caller cancelled while waiting for admission.
    #[error("Cancelled while waiting for admission")]
    Cancelled,
}

impl AdmissionError {
    /// The rate-limit tier that rejected the request, if any.
    #[must_use]
    pub fn tier(&self) -> Option<RateLimitTier> {
        match self {
            Self::RateLimitExceeded { tier, .. } => Some(*tier),
            _ => None,
        }
    }
}

/// Returned by a circuit breaker that refused to run the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit open for dependency '{dependency}'")]
pub struct CircuitOpen {
    /// Name of the guarded dependency.
    pub dependency: String,
}

/// A cooperative cancellation signal fired before the work finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Outcome of a guarded call that did not produce a value.
///
/// `E` is the error type of the wrapped operation.
#[derive(Error, Debug)]
pub enum FloodgateError<E> {
    /// The request was shed at admission.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The dependency's circuit is open and no fallback was supplied.
    #[error("Circuit open for dependency '{dependency}'")]
    CircuitOpen {
        /// Name of the guarded dependency.
        dependency: String,
    },

    /// Every attempt failed; `source` is the error of the final attempt.
    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts performed.
        attempts: u32,
        /// The error returned by the last attempt.
        source: E,
    },

    /// The final attempt exceeded its per-attempt timeout.
    #[error("Attempt {attempts} timed out after {timeout:?}")]
    AttemptTimeout {
        /// Number of attempts performed.
        attempts: u32,
        /// The per-attempt timeout.
        timeout: Duration,
    },

    /// The overall retry deadline elapsed.
    #[error("Deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// The caller cancelled the call.
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation failed with an error classified as non-retryable.
    #[error("{0}")]
    Operation(E),
}

impl<E> FloodgateError<E> {
    /// Whether this error means the service is shedding load.
    ///
    /// Overload errors must be surfaced to the caller immediately and not
    /// retried at this layer.
    #[must_use]
    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            Self::Admission(
                AdmissionError::RateLimitExceeded { .. }
                    | AdmissionError::QueueFull { .. }
                    | AdmissionError::EnqueueTimeout { .. }
            )
        )
    }

    /// Whether the circuit breaker rejected the call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Admission(AdmissionError::Cancelled)
        )
    }

    /// Whether this error reflects on the health of the dependency.
    ///
    /// Retry exhaustion and timeouts do. Non-retryable operation errors
    /// (rejected input and the like), shedding, cancellation and open circuits
    /// do not.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::RetryExhausted { .. } | Self::AttemptTimeout { .. } | Self::DeadlineExceeded { .. }
        )
    }

    /// The underlying operation error, if the failure came from the operation.
    #[must_use]
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::RetryExhausted { source, .. } | Self::Operation(source) => Some(source),
            _ => None,
        }
    }

    /// Consume the error and return the underlying operation error, if any.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::RetryExhausted { source, .. } | Self::Operation(source) => Some(source),
            _ => None,
        }
    }
}

impl<E> From<CircuitOpen> for FloodgateError<E> {
    fn from(err: CircuitOpen) -> Self {
        Self::CircuitOpen {
            dependency: err.dependency,
        }
    }
}

impl<E> From<Cancelled> for FloodgateError<E> {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors raised by a remote cache store.
///
/// These never reach request handlers: the tiered cache logs them and
/// behaves as if the key were missing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The store could not be reached or returned an error.
    #[error("Cache unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
    },

    /// The store did not answer within the tier's timeout.
    #[error("Cache {operation} timed out after {timeout:?}")]
    Timeout {
        /// The store operation that timed out.
        operation: &'static str,
        /// The configured remote timeout.
        timeout: Duration,
    },
}

impl CacheError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Invalid configuration detected at construction time.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
