//! Bounded admission of submitted request tasks.
//!
//! The scheduler caps how many tasks the facade has running at once,
//! independently of the per-transport concurrency policy. Admission is FIFO;
//! priority lives in the retry engine, not here. Cancelling a handle cancels
//! the underlying task, and a task whose handle is cancelled before
//! admission is discarded without ever being started.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::HammerTimeError;

/// Default cap on simultaneously running tasks.
pub const DEFAULT_LIMIT: usize = 1000;

/// Bounded-parallelism frontier for the facade's tasks.
pub struct RequestScheduler {
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl RequestScheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Enqueues `work`. It starts immediately if a slot is free, otherwise
    /// it waits its turn in FIFO order. The returned handle resolves with
    /// the task's output, or with [`HammerTimeError::Cancelled`] if the
    /// handle or the scheduler is cancelled first.
    pub fn request<F, T>(&self, work: F) -> RequestHandle<T>
    where
        F: Future<Output = Result<T, HammerTimeError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = self.token.child_token();
        let task_token = token.clone();
        let slots = self.slots.clone();

        if self.tracker.is_closed() {
            let _ = tx.send(Err(HammerTimeError::Cancelled));
            return RequestHandle { rx, token };
        }

        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = task_token.cancelled() => {
                    // Never admitted: the work future is dropped unpolled.
                    let _ = tx.send(Err(HammerTimeError::Cancelled));
                    return;
                }
                permit = slots.acquire_owned() => permit,
            };
            let _permit = match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send(Err(HammerTimeError::Cancelled));
                    return;
                }
            };
            let output = tokio::select! {
                biased;
                _ = task_token.cancelled() => Err(HammerTimeError::Cancelled),
                output = work => output,
            };
            let _ = tx.send(output);
        });

        RequestHandle { rx, token }
    }

    /// Number of tasks admitted or waiting.
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every outstanding task and waits for all of them to settle.
    /// Tasks requested afterwards resolve immediately with cancellation.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

/// Handle to a scheduled task. Awaiting it yields the task's output;
/// dropping it leaves the task running.
pub struct RequestHandle<T> {
    rx: oneshot::Receiver<Result<T, HammerTimeError>>,
    token: CancellationToken,
}

impl<T> RequestHandle<T> {
    /// Cancels the underlying task. A task still waiting for admission is
    /// discarded without being started.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Builds a handle that is already resolved with cancellation. Used by
    /// the facade for submissions after close.
    pub(crate) fn cancelled() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(HammerTimeError::Cancelled));
        Self {
            rx,
            token: CancellationToken::new(),
        }
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = Result<T, HammerTimeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(output) => output,
            // The task was dropped without reporting, e.g. aborted runtime.
            Err(_) => Err(HammerTimeError::Cancelled),
        })
    }
}
