//! Circuit breaker for unreliable dependencies.
//!
//! # States
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(recovery_timeout elapsed, next call)--> HalfOpen
//! HalfOpen --(success_threshold consecutive successes)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```
//!
//! One breaker guards one logical dependency. State lives behind a mutex
//! owned by that breaker, and the lock is only held to take a permit and to
//! record the result, never while the guarded operation runs.
//!
//! Results are tagged with the generation in which their permit was issued.
//! A call admitted while Closed that finishes after the circuit has already
//! opened does not count against the new state.
//!
//! # Example
//!
//! ```rust
//! use floodgate::breaker::CircuitBreaker;
//! use floodgate::config::CircuitBreakerConfig;
//! use floodgate::FloodgateError;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("billing-api", CircuitBreakerConfig::default());
//!
//! let result: Result<u32, FloodgateError<std::io::Error>> =
//!     breaker.call(|| async { Ok(42) }).await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

use crate::config::CircuitBreakerConfig;
use crate::error::{Cancelled, CircuitOpen};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A limited number of trial calls decide whether to close again.
    HalfOpen,
}

impl CircuitState {
    /// Get the state as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A result that may have been produced by a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome<T> {
    /// The value returned by the operation or the fallback.
    pub value: T,
    /// `true` when the circuit was open and the fallback served the call.
    pub degraded: bool,
}

impl<T> CallOutcome<T> {
    fn primary(value: T) -> Self {
        Self {
            value,
            degraded: false,
        }
    }

    fn degraded(value: T) -> Self {
        Self {
            value,
            degraded: true,
        }
    }

    /// Discard the degraded flag.
    pub fn into_inner(self) -> T {
        self.value
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
}

#[derive(Debug, Default)]
struct BreakerCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    fallbacks: AtomicU64,
    opens: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    trial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    // Cancelled, dropped, or an error that says nothing about the dependency.
    Neutral,
}

/// Records a verdict exactly once, even if the call future is dropped.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl PermitGuard<'_> {
    fn settle(mut self, verdict: Verdict) {
        self.settled = true;
        self.breaker.record(self.permit, verdict);
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.permit, Verdict::Neutral);
        }
    }
}

/// A circuit breaker guarding one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    counters: BreakerCounters,
}

impl CircuitBreaker {
    /// Create a closed breaker for the named dependency.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
            counters: BreakerCounters::default(),
        }
    }

    /// Name of the guarded dependency.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    ///
    /// An Open breaker whose recovery timeout has elapsed still reports
    /// `Open` until the next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls return `CircuitOpen` converted into the caller's error
    /// type without invoking `op`.
    pub async fn call<T, Err, F, Fut>(&self, op: F) -> Result<T, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<CircuitOpen>,
    {
        let guard = self.acquire()?;
        let result = op().await;
        guard.settle(verdict_of(&result));
        result
    }

    /// Run `op` through the breaker, serving rejected calls from `fallback`.
    ///
    /// The fallback's result is flagged as degraded. Fallback outcomes do not
    /// affect the breaker state.
    pub async fn call_with_fallback<T, Err, F, Fut, G, GFut>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<CallOutcome<T>, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Err>>,
    {
        match self.acquire() {
            Ok(guard) => {
                let result = op().await;
                guard.settle(verdict_of(&result));
                result.map(CallOutcome::primary)
            }
            Err(_) => self.serve_fallback(fallback).await,
        }
    }

    /// Run `op` through the breaker, abandoning it when `cancel` fires.
    ///
    /// A cancelled call counts as neither success nor failure and releases
    /// its HalfOpen trial slot.
    pub async fn call_with_cancel<T, Err, F, Fut>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> Result<T, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: From<CircuitOpen> + From<Cancelled>,
    {
        self.call_with_classifier(op, |_: &Err| true, cancel).await
    }

    /// Like [`call_with_cancel`](Self::call_with_cancel), but only errors for
    /// which `is_failure` returns `true` count against the circuit.
    ///
    /// Other errors, such as rejected client input, leave the failure count
    /// untouched and release a HalfOpen trial slot without closing the
    /// circuit.
    pub async fn call_with_classifier<T, Err, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
        cancel: &CancellationToken,
    ) -> Result<T, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        P: Fn(&Err) -> bool,
        Err: From<CircuitOpen> + From<Cancelled>,
    {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let guard = self.acquire()?;
        self.run_cancellable(guard, op, &is_failure, cancel).await
    }

    /// Combination of [`call_with_fallback`](Self::call_with_fallback) and
    /// [`call_with_cancel`](Self::call_with_cancel).
    pub async fn call_with_fallback_and_cancel<T, Err, F, Fut, G, GFut>(
        &self,
        op: F,
        fallback: G,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome<T>, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Err>>,
        Err: From<Cancelled>,
    {
        self.call_with_fallback_and_classifier(op, |_: &Err| true, fallback, cancel)
            .await
    }

    /// [`call_with_fallback_and_cancel`](Self::call_with_fallback_and_cancel)
    /// with the failure classification of
    /// [`call_with_classifier`](Self::call_with_classifier).
    pub async fn call_with_fallback_and_classifier<T, Err, F, Fut, P, G, GFut>(
        &self,
        op: F,
        is_failure: P,
        fallback: G,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome<T>, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        P: Fn(&Err) -> bool,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Err>>,
        Err: From<Cancelled>,
    {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        match self.acquire() {
            Ok(guard) => self
                .run_cancellable(guard, op, &is_failure, cancel)
                .await
                .map(CallOutcome::primary),
            Err(_) => self.serve_fallback(fallback).await,
        }
    }

    async fn run_cancellable<T, Err, F, Fut, P>(
        &self,
        guard: PermitGuard<'_>,
        op: F,
        is_failure: &P,
        cancel: &CancellationToken,
    ) -> Result<T, Err>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        P: Fn(&Err) -> bool,
        Err: From<Cancelled>,
    {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                guard.settle(Verdict::Neutral);
                Err(Cancelled.into())
            }
            result = op() => {
                guard.settle(classify(&result, is_failure));
                result
            }
        }
    }

    async fn serve_fallback<T, Err, G, GFut>(&self, fallback: G) -> Result<CallOutcome<T>, Err>
    where
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Err>>,
    {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        fallback().await.map(CallOutcome::degraded)
    }

    fn acquire(&self) -> Result<PermitGuard<'_>, CircuitOpen> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let permit = match inner.state {
            CircuitState::Closed => Some(Permit {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout_duration() {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    Some(Permit {
                        generation: inner.generation,
                        trial: true,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Some(Permit {
                        generation: inner.generation,
                        trial: true,
                    })
                } else {
                    None
                }
            }
        };

        match permit {
            Some(permit) => Ok(PermitGuard {
                breaker: self,
                permit,
                settled: false,
            }),
            None => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                Err(CircuitOpen {
                    dependency: self.name.clone(),
                })
            }
        }
    }

    fn record(&self, permit: Permit, verdict: Verdict) {
        match verdict {
            Verdict::Success => self.counters.successes.fetch_add(1, Ordering::Relaxed),
            Verdict::Failure => self.counters.failures.fetch_add(1, Ordering::Relaxed),
            Verdict::Neutral => 0,
        };

        let now = Instant::now();
        let mut inner = self.lock();
        if inner.generation != permit.generation {
            return;
        }
        if permit.trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, verdict) {
            (CircuitState::Closed, Verdict::Success) => inner.consecutive_failures = 0,
            (CircuitState::Closed, Verdict::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, Verdict::Success) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, Verdict::Failure) => {
                self.transition(&mut inner, CircuitState::Open, now);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = (to == CircuitState::Open).then_some(now);

        match to {
            CircuitState::Open => {
                self.counters.opens.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dependency = %self.name,
                    from = %from,
                    recovery_timeout_secs = self.config.recovery_timeout_secs,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(dependency = %self.name, "circuit half-open, probing dependency");
            }
            CircuitState::Closed => {
                info!(dependency = %self.name, from = %from, "circuit closed");
            }
        }
    }

    /// Force the breaker back to Closed and clear its counters.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, now);
        } else {
            inner.consecutive_failures = 0;
        }
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        CircuitSnapshot {
            dependency: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            open_for_ms: inner
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            opens: self.counters.opens.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn verdict_of<T, E>(result: &Result<T, E>) -> Verdict {
    classify(result, &|_: &E| true)
}

fn classify<T, E>(result: &Result<T, E>, is_failure: &impl Fn(&E) -> bool) -> Verdict {
    match result {
        Ok(_) => Verdict::Success,
        Err(err) if is_failure(err) => Verdict::Failure,
        Err(_) => Verdict::Neutral,
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Guarded dependency.
    pub dependency: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while Closed.
    pub consecutive_failures: u32,
    /// Consecutive successes while HalfOpen.
    pub consecutive_successes: u32,
    /// Milliseconds since the circuit opened, when Open.
    pub open_for_ms: Option<u64>,
    /// Calls offered to the breaker.
    pub calls: u64,
    /// Calls whose operation succeeded.
    pub successes: u64,
    /// Calls whose operation failed.
    pub failures: u64,
    /// Calls rejected without running the operation.
    pub rejections: u64,
    /// Rejected calls served by a fallback.
    pub fallbacks: u64,
    /// Times the circuit opened.
    pub opens: u64,
}

/// One breaker per named dependency, sharing a configuration.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The breaker for `dependency`, created on first use.
    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
        {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(dependency.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, self.config.clone()))),
        )
    }

    /// The breaker for `dependency`, if one exists.
    #[must_use]
    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
            .cloned()
    }

    /// Snapshots of every breaker, sorted by dependency name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }
}
