//! Retry engine: wraps the transport with retry accounting and the two
//! concurrency lanes.
//!
//! The general lane carries caller traffic and is gated by the scaling
//! policy's semaphore; its latencies feed the policy. The priority lane is a
//! narrow fixed semaphore reserved for internal probes (soft-404 samples,
//! redirect follow-ups, catch-all checks) so detection work is never starved
//! by the bulk of the queue.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use url::Url;

use crate::core::Stats;
use crate::engine::Engine;
use crate::engine::scaling::{ScalingPolicy, SharedPolicy};
use crate::error::{HammerTimeError, RuleResult};
use crate::http::Entry;
use crate::ruleset::Heuristics;

/// Number of permits of the priority lane.
pub const DEFAULT_PRIORITY_PERMITS: usize = 10;

#[derive(Clone, Copy)]
enum Lane {
    General,
    Priority,
}

/// Transport wrapper adding retries, the concurrency lanes and latency
/// accounting.
pub struct RetryEngine {
    transport: Arc<dyn Engine>,
    policy: SharedPolicy,
    priority_limiter: Semaphore,
    retry_count: u32,
    retry_delay: Duration,
    stats: Arc<Stats>,
    /// Pipeline of the first general-lane call, reused for internal probes
    /// when no pipeline is supplied. Weak so a torn-down facade is not kept
    /// alive by its own engine.
    default_heuristics: OnceCell<Weak<Heuristics>>,
}

impl RetryEngine {
    pub fn new(
        transport: Arc<dyn Engine>,
        policy: SharedPolicy,
        stats: Arc<Stats>,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            policy,
            priority_limiter: Semaphore::new(DEFAULT_PRIORITY_PERMITS),
            retry_count,
            retry_delay,
            stats,
            default_heuristics: OnceCell::new(),
        }
    }

    /// Retry budget: number of additional attempts after the first.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Performs `entry` on the general lane.
    pub async fn perform(&self, entry: &mut Entry, heuristics: &Arc<Heuristics>) -> RuleResult {
        let _ = self.default_heuristics.set(Arc::downgrade(heuristics));
        self.perform_in_lane(Lane::General, entry, heuristics).await
    }

    /// Performs `entry` on the priority lane. Falls back to the pipeline of
    /// the first general-lane call when none is supplied.
    pub async fn perform_high_priority(
        &self,
        entry: &mut Entry,
        heuristics: Option<&Arc<Heuristics>>,
    ) -> RuleResult {
        let fallback;
        let heuristics = match heuristics {
            Some(heuristics) => heuristics,
            None => {
                fallback = self
                    .default_heuristics
                    .get()
                    .and_then(Weak::upgrade)
                    .ok_or(HammerTimeError::Cancelled)?;
                &fallback
            }
        };
        self.perform_in_lane(Lane::Priority, entry, heuristics).await
    }

    async fn perform_in_lane(
        &self,
        lane: Lane,
        entry: &mut Entry,
        heuristics: &Arc<Heuristics>,
    ) -> RuleResult {
        loop {
            let attempt = match lane {
                Lane::General => {
                    let guard = self.policy.semaphore().acquire().await;
                    let started = Instant::now();
                    let outcome = self.transport.perform(entry, heuristics).await;
                    drop(guard);
                    if outcome.is_ok() {
                        self.policy.record(started.elapsed());
                    }
                    outcome
                }
                Lane::Priority => {
                    let _permit = self
                        .priority_limiter
                        .acquire()
                        .await
                        .expect("priority lane semaphore is never closed");
                    self.transport.perform(entry, heuristics).await
                }
            };

            let outcome = match attempt {
                Ok(()) => heuristics.on_request_successful(entry).await,
                Err(error) => Err(error),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(HammerTimeError::Stop(reason)) => {
                    if entry.result.attempt > self.retry_count {
                        return Err(HammerTimeError::Stop(reason));
                    }
                    entry.result.attempt += 1;
                    self.stats.add_retry();
                    entry.response = None;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Closes the underlying transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Routes subsequent transport calls through `proxy`.
    pub fn set_proxy(&self, proxy: Option<Url>) {
        self.transport.set_proxy(proxy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scaling::StaticPolicy;
    use crate::ruleset::Heuristic;
    use crate::testing::{FakeEngine, FakeStep, entry_for};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine_over(transport: Arc<FakeEngine>, retry_count: u32) -> Arc<RetryEngine> {
        Arc::new(RetryEngine::new(
            transport,
            Arc::new(StaticPolicy::new(50)),
            Arc::new(Stats::new()),
            retry_count,
            Duration::from_millis(10),
        ))
    }

    fn pipeline() -> Arc<Heuristics> {
        crate::testing::empty_heuristics()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_counts_attempts() {
        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::Timeout,
            FakeStep::Timeout,
            FakeStep::ok("done"),
        ]));
        let engine = engine_over(transport.clone(), 2);
        let mut entry = entry_for("http://example.com/x");

        engine.perform(&mut entry, &pipeline()).await.unwrap();

        assert_eq!(entry.result.attempt, 3);
        assert_eq!(engine.stats().retries(), 2);
        assert_eq!(transport.perform_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_propagates_stop() {
        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::Timeout,
            FakeStep::Timeout,
            FakeStep::Timeout,
        ]));
        let engine = engine_over(transport.clone(), 2);
        let mut entry = entry_for("http://example.com/x");

        let result = engine.perform(&mut entry, &pipeline()).await;
        assert!(matches!(result, Err(HammerTimeError::Stop(_))));
        assert_eq!(transport.perform_count(), 3);
        assert_eq!(engine.stats().retries(), 2);
    }

    #[tokio::test]
    async fn reject_is_never_retried() {
        let transport = Arc::new(FakeEngine::scripted([FakeStep::Reject("policy".into())]));
        let engine = engine_over(transport.clone(), 5);
        let mut entry = entry_for("http://example.com/x");

        let result = engine.perform(&mut entry, &pipeline()).await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));
        assert_eq!(transport.perform_count(), 1);
        assert_eq!(engine.stats().retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn response_is_cleared_between_attempts() {
        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::ok("first"),
            FakeStep::ok("second"),
        ]));
        let engine = engine_over(transport, 1);
        let mut entry = entry_for("http://example.com/x");

        // A rule failing on_request_successful with Stop forces a retry
        // after the response was already delivered.
        struct FailOnce {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Heuristic for FailOnce {
            async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HammerTimeError::stop("unstable"))
                } else {
                    assert!(entry.response.is_some());
                    Ok(())
                }
            }
        }

        let heuristics = pipeline();
        heuristics
            .add(Arc::new(FailOnce { calls: AtomicU32::new(0) }))
            .unwrap();

        engine.perform(&mut entry, &heuristics).await.unwrap();
        assert_eq!(entry.result.attempt, 2);
        let body = entry.response.unwrap().raw().clone();
        assert_eq!(body.as_ref(), b"second");
    }

    #[tokio::test]
    async fn priority_lane_falls_back_to_default_heuristics() {
        let transport = Arc::new(FakeEngine::ok());
        let engine = engine_over(transport, 0);

        let heuristics = pipeline();
        let mut first = entry_for("http://example.com/a");
        engine.perform(&mut first, &heuristics).await.unwrap();

        // No pipeline supplied: the first general-lane pipeline is reused.
        let mut probe = entry_for("http://example.com/probe");
        engine.perform_high_priority(&mut probe, None).await.unwrap();
        assert!(probe.response.is_some());
    }

    #[tokio::test]
    async fn priority_lane_without_any_pipeline_reports_cancelled() {
        let transport = Arc::new(FakeEngine::ok());
        let engine = engine_over(transport, 0);

        let mut probe = entry_for("http://example.com/probe");
        let result = engine.perform_high_priority(&mut probe, None).await;
        assert_eq!(result, Err(HammerTimeError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_host_invokes_the_hook_and_retries() {
        struct CountUnreachable {
            calls: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Heuristic for CountUnreachable {
            async fn on_host_unreachable(&self, _entry: &mut Entry) -> RuleResult {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::Unreachable,
            FakeStep::ok("back up"),
        ]));
        let engine = engine_over(transport, 1);
        let calls = Arc::new(AtomicU32::new(0));
        let heuristics = pipeline();
        heuristics
            .add(Arc::new(CountUnreachable { calls: calls.clone() }))
            .unwrap();

        let mut entry = entry_for("http://example.com/x");
        engine.perform(&mut entry, &heuristics).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(entry.result.attempt, 2);
    }

    #[tokio::test]
    async fn close_reaches_the_transport() {
        let transport = Arc::new(FakeEngine::ok());
        let engine = engine_over(transport.clone(), 0);
        engine.close().await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }
}
