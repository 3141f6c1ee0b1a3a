//! Bounded admission queue.
//!
//! Producers take a slot before their item is stored and consumers give the
//! slot back when they take the item out, so the depth never exceeds
//! `max_depth`. A producer that finds the queue full either fails at once
//! (zero timeout) or waits up to its enqueue timeout for a slot.
//!
//! # Example
//!
//! ```rust
//! use floodgate::config::QueueConfig;
//! use floodgate::queue::BackpressureQueue;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let queue = BackpressureQueue::new(QueueConfig::new(2));
//! assert!(queue.admit("a", Duration::ZERO).await);
//! assert!(queue.admit("b", Duration::ZERO).await);
//! assert!(!queue.admit("c", Duration::ZERO).await);
//!
//! assert_eq!(queue.recv().await, Some("a"));
//! # }
//! ```

use crate::config::QueueConfig;
use crate::error::AdmissionError;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A bounded FIFO with admission control.
pub struct BackpressureQueue<T> {
    config: QueueConfig,
    slots: Semaphore,
    items: Mutex<VecDeque<T>>,
    ready: Notify,
    closed: AtomicBool,
    admitted: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
}

impl<T> BackpressureQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        let max_depth = config.max_depth.min(Semaphore::MAX_PERMITS);
        Self {
            slots: Semaphore::new(max_depth),
            items: Mutex::new(VecDeque::with_capacity(max_depth.min(1024))),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            admitted: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
        }
    }

    /// The queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Offer `item`, waiting up to `timeout` for a free slot.
    ///
    /// Returns `false` if the item was not enqueued. A zero timeout never
    /// waits.
    pub async fn admit(&self, item: T, timeout: Duration) -> bool {
        self.enqueue(item, timeout, None).await.is_ok()
    }

    /// Offer `item` with an explicit reason on failure.
    ///
    /// `cancel` aborts the wait for a slot.
    pub async fn admit_with_cancel(
        &self,
        item: T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AdmissionError> {
        self.enqueue(item, timeout, Some(cancel)).await
    }

    async fn enqueue(
        &self,
        item: T,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::QueueClosed);
        }

        match self.slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::QueueClosed),
            Err(TryAcquireError::NoPermits) if timeout.is_zero() => {
                return Err(self.reject(AdmissionError::QueueFull {
                    max_depth: self.config.max_depth,
                }));
            }
            Err(TryAcquireError::NoPermits) => {
                let acquired = tokio::select! {
                    biased;
                    () = cancelled(cancel) => return Err(AdmissionError::Cancelled),
                    acquired = tokio::time::timeout(timeout, self.slots.acquire()) => acquired,
                };
                match acquired {
                    Ok(Ok(permit)) => permit.forget(),
                    Ok(Err(_)) => return Err(AdmissionError::QueueClosed),
                    Err(_) => {
                        return Err(self.reject(AdmissionError::EnqueueTimeout { waited: timeout }));
                    }
                }
            }
        }

        self.lock().push_back(item);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        Ok(())
    }

    fn reject(&self, err: AdmissionError) -> AdmissionError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(depth = self.depth(), max_depth = self.config.max_depth, error = %err, "queue admission rejected");
        err
    }

    /// Take the oldest item, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Take the oldest item if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        let item = self.lock().pop_front()?;
        self.slots.add_permits(1);
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Stop accepting items.
    ///
    /// Producers waiting for a slot fail with `QueueClosed`. Consumers drain
    /// what is left and then receive `None`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.slots.close();
            self.ready.notify_waiters();
            debug!(remaining = self.lock().len(), "queue closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Slots currently taken.
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_closed() {
            return self.lock().len();
        }
        self.config
            .max_depth
            .saturating_sub(self.slots.available_permits())
    }

    /// Depth as a fraction of `max_depth`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.depth() as f64 / self.config.max_depth.max(1) as f64
    }

    /// Whether utilization is below the health threshold.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.utilization() < self.config.health_threshold
    }

    /// Counters and depth.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            max_depth: self.config.max_depth,
            utilization: self.utilization(),
            admitted: self.admitted.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> fmt::Debug for BackpressureQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureQueue")
            .field("depth", &self.depth())
            .field("max_depth", &self.config.max_depth)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Queue counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    /// Slots currently taken.
    pub depth: usize,
    /// Configured capacity.
    pub max_depth: usize,
    /// `depth / max_depth`.
    pub utilization: f64,
    /// Items accepted.
    pub admitted: u64,
    /// Items taken out by consumers.
    pub dequeued: u64,
    /// Offers refused because the queue was full.
    pub rejected: u64,
    /// Whether the queue was closed.
    pub closed: bool,
}

/// A queued payload paired with the channel its result goes back on.
#[derive(Debug)]
pub struct PendingWork<P, R> {
    /// The work item.
    pub payload: P,
    responder: oneshot::Sender<R>,
}

impl<P, R> PendingWork<P, R> {
    /// Send the result to the submitter.
    ///
    /// Returns the result back if the submitter stopped waiting.
    pub fn respond(self, result: R) -> Result<(), R> {
        self.responder.send(result)
    }

    /// Whether the submitter has dropped its receiver.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

impl<P, R> BackpressureQueue<PendingWork<P, R>> {
    /// Enqueue `payload` and return a receiver for its result.
    pub async fn submit(
        &self,
        payload: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<oneshot::Receiver<R>, AdmissionError> {
        let (responder, receiver) = oneshot::channel();
        self.admit_with_cancel(PendingWork { payload, responder }, timeout, cancel)
            .await?;
        Ok(receiver)
    }
}
