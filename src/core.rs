//! The `HammerTime` facade: request submission, lifecycle orchestration and
//! the successful-requests stream.
//!
//! A submission returns a handle resolving to the completed [`Entry`] or to
//! the failure that terminated it. Independently of handles, callers that
//! enabled collection can iterate entries as they complete through
//! [`HammerTime::successful_requests`]; the stream ends when no work remains
//! in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use url::Url;

use crate::engine::retry::RetryEngine;
use crate::http::{Arguments, Entry, Request};
use crate::kb::KnowledgeBase;
use crate::ruleset::Heuristics;
use crate::scheduler::{RequestHandle, RequestScheduler};

/// Engine counters. `requested` grows on submission, `completed` on every
/// terminal outcome; the two being equal defines quiescence.
pub struct Stats {
    start: Instant,
    requested: AtomicU64,
    completed: AtomicU64,
    retries: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Wall-clock time since the engine was created.
    pub fn duration(&self) -> Duration {
        self.start.elapsed()
    }

    /// Completed requests per second since creation.
    pub fn rate(&self) -> f64 {
        self.completed() as f64 / self.duration().as_secs_f64()
    }

    pub(crate) fn add_requested(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

type SuccessSender = UnboundedSender<Option<Entry>>;
type SuccessReceiver = UnboundedReceiver<Option<Entry>>;

/// Completion bookkeeping that must run exactly once per submission, no
/// matter how the task ends. Dropping the guard counts the completion and
/// unblocks the success stream at quiescence with a sentinel.
struct CompletionGuard {
    stats: Arc<Stats>,
    in_flight: Arc<AtomicU64>,
    tx: Option<SuccessSender>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.stats.add_completed();
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            if let Some(tx) = &self.tx {
                let _ = tx.send(None);
            }
        }
    }
}

/// High-volume HTTP request engine.
pub struct HammerTime {
    stats: Arc<Stats>,
    kb: Arc<KnowledgeBase>,
    engine: Arc<RetryEngine>,
    heuristics: Arc<Heuristics>,
    scheduler: RequestScheduler,
    in_flight: Arc<AtomicU64>,
    success_tx: Mutex<Option<SuccessSender>>,
    success_rx: Arc<Mutex<Option<SuccessReceiver>>>,
    closed: AtomicBool,
    interrupt_installed: AtomicBool,
}

impl HammerTime {
    /// Entry point for configuration; see [`crate::config::HammerTimeBuilder`].
    pub fn builder() -> crate::config::HammerTimeBuilder {
        crate::config::HammerTimeBuilder::new()
    }

    pub(crate) fn from_parts(
        stats: Arc<Stats>,
        kb: Arc<KnowledgeBase>,
        engine: Arc<RetryEngine>,
        heuristics: Arc<Heuristics>,
        scheduler: RequestScheduler,
    ) -> Self {
        Self {
            stats,
            kb,
            engine,
            heuristics,
            scheduler,
            in_flight: Arc::new(AtomicU64::new(0)),
            success_tx: Mutex::new(None),
            success_rx: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
            interrupt_installed: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn kb(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// The rule pipeline; register heuristics here before submitting.
    pub fn heuristics(&self) -> &Arc<Heuristics> {
        &self.heuristics
    }

    pub fn requested_count(&self) -> u64 {
        self.stats.requested()
    }

    pub fn completed_count(&self) -> u64 {
        self.stats.completed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Routes subsequent transport calls through `proxy`.
    pub fn set_proxy(&self, proxy: Option<Url>) {
        self.engine.set_proxy(proxy);
    }

    /// Submits a GET request for `url`.
    pub fn request(&self, url: Url) -> RequestHandle<Entry> {
        self.submit(Request::new(url))
    }

    /// Submits a request with default arguments.
    pub fn submit(&self, request: Request) -> RequestHandle<Entry> {
        self.submit_with_arguments(request, Arguments::default())
    }

    /// Submits a request with explicit transport hints.
    pub fn submit_with_arguments(
        &self,
        request: Request,
        arguments: Arguments,
    ) -> RequestHandle<Entry> {
        if self.is_closed() {
            return RequestHandle::cancelled();
        }
        self.stats.add_requested();
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let guard = CompletionGuard {
            stats: self.stats.clone(),
            in_flight: self.in_flight.clone(),
            tx: self.success_tx.lock().clone(),
        };
        let engine = self.engine.clone();
        let heuristics = self.heuristics.clone();
        let mut entry = Entry::with_arguments(request, arguments);

        self.scheduler.request(async move {
            let guard = guard;
            match engine.perform(&mut entry, &heuristics).await {
                Ok(()) => {
                    if let Some(tx) = &guard.tx {
                        let _ = tx.send(Some(entry.clone()));
                    }
                    drop(guard);
                    Ok(entry)
                }
                Err(error) => {
                    tracing::debug!(url = %entry.request.url, %error, "request terminated");
                    drop(guard);
                    Err(error)
                }
            }
        })
    }

    /// Enables the success stream. Must be called before submissions whose
    /// entries should be collected.
    pub fn collect_successful_requests(&self) {
        let (tx, rx) = unbounded_channel();
        *self.success_tx.lock() = Some(tx);
        *self.success_rx.lock() = Some(rx);
    }

    /// Stream of successfully completed entries. Yields entries as they
    /// complete and ends once nothing is left in flight. Requires
    /// [`collect_successful_requests`](Self::collect_successful_requests)
    /// to have been called.
    pub fn successful_requests(&self) -> SuccessStream {
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            if let Some(tx) = &*self.success_tx.lock() {
                let _ = tx.send(None);
            }
        }
        SuccessStream {
            rx: self.success_rx.lock().take(),
            slot: self.success_rx.clone(),
        }
    }

    /// Cancels outstanding work, waits for settlement and closes the
    /// transport. Idempotent; subsequent submissions resolve immediately
    /// with cancellation.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.close().await;
        self.engine.close().await;
    }

    /// Installs a ctrl-c hook scheduling [`close`](Self::close) exactly
    /// once. Hosts that forbid signal handlers can skip this and drive
    /// `close` themselves.
    pub fn handle_interrupts(self: &Arc<Self>) {
        if self.interrupt_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let facade = Arc::downgrade(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Some(facade) = facade.upgrade() {
                    facade.close().await;
                }
            }
        });
    }
}

/// Stream of completed entries, ending at quiescence.
///
/// Obtained from [`HammerTime::successful_requests`]. Iterate with
/// [`next`](SuccessStream::next) or through the `Stream` implementation.
/// Dropping the stream hands the underlying channel back to the facade so a
/// later call can pick up where this one stopped.
pub struct SuccessStream {
    rx: Option<SuccessReceiver>,
    slot: Arc<Mutex<Option<SuccessReceiver>>>,
}

impl SuccessStream {
    /// Next successful entry, or `None` once no work remains in flight.
    pub async fn next(&mut self) -> Option<Entry> {
        std::future::poll_fn(|cx| self.poll_next_entry(cx)).await
    }

    fn poll_next_entry(&mut self, cx: &mut Context<'_>) -> Poll<Option<Entry>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(Some(entry))) => Poll::Ready(Some(entry)),
            // Sentinel or closed channel: the iteration is over.
            Poll::Ready(Some(None)) | Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl tokio_stream::Stream for SuccessStream {
    type Item = Entry;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.poll_next_entry(cx)
    }
}

impl Drop for SuccessStream {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.slot.lock() = Some(rx);
        }
    }
}
