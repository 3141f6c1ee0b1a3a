//! Scripted guarded operations.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Error returned by a [`ScriptedOperation`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestError {
    /// A failure worth retrying (timeouts, 5xx).
    #[error("transient: {0}")]
    Transient(String),
    /// A failure that will not go away (4xx, validation).
    #[error("permanent: {0}")]
    Permanent(String),
    /// The script ran out of outcomes.
    #[error("script exhausted after {0} calls")]
    Exhausted(u32),
}

impl TestError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Retry classifier: only transient errors are retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// An operation that replays a fixed list of outcomes.
///
/// Each call takes the next outcome. Once the script is used up every call
/// fails with [`TestError::Exhausted`].
#[derive(Debug)]
pub struct ScriptedOperation<T> {
    script: Mutex<VecDeque<Result<T, TestError>>>,
    invocations: AtomicU32,
    delay: Duration,
}

impl<T: Send + 'static> ScriptedOperation<T> {
    /// Create an operation that replays `outcomes` in order.
    pub fn new(outcomes: impl IntoIterator<Item = Result<T, TestError>>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            invocations: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// An operation that fails transiently `failures` times, then yields `value`.
    pub fn fail_then_succeed(failures: usize, value: T) -> Self {
        let outcomes = (0..failures)
            .map(|i| Err(TestError::transient(format!("attempt {}", i + 1))))
            .chain(std::iter::once(Ok(value)));
        Self::new(outcomes)
    }

    /// Sleep for `delay` before producing each outcome.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run one invocation.
    pub fn call(&self) -> BoxFuture<'static, Result<T, TestError>> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(TestError::Exhausted(invocation - 1)));
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
        .boxed()
    }

    /// How many times the operation was invoked.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Outcomes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// An operation that always fails transiently.
pub fn always_failing<T: Send + 'static>(message: &'static str) -> impl Fn() -> BoxFuture<'static, Result<T, TestError>> {
    move || async move { Err(TestError::transient(message)) }.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order_then_exhausts() {
        let op = ScriptedOperation::new([Ok(1), Err(TestError::permanent("bad")), Ok(3)]);
        assert_eq!(op.call().await, Ok(1));
        assert_eq!(op.call().await, Err(TestError::permanent("bad")));
        assert_eq!(op.call().await, Ok(3));
        assert_eq!(op.call().await, Err(TestError::Exhausted(3)));
        assert_eq!(op.invocations(), 4);
        assert_eq!(op.remaining(), 0);
    }

    #[tokio::test]
    async fn test_fail_then_succeed() {
        let op = ScriptedOperation::fail_then_succeed(2, "ok");
        assert!(op.call().await.unwrap_err().is_retryable());
        assert!(op.call().await.is_err());
        assert_eq!(op.call().await, Ok("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let op = ScriptedOperation::new([Ok(())]).with_delay(Duration::from_millis(250));
        let started = tokio::time::Instant::now();
        op.call().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(250));
    }
}
