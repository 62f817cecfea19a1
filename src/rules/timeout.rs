//! Dynamic per-request timeouts from rolling latency statistics.
//!
//! Until enough samples exist the timeout sits at 80% of the configured
//! maximum. With a full window it becomes `mean * 2 + stdev * 4` over the
//! recent delays, clamped to the configured bounds. After a timeout, the
//! next attempts double the largest timed-out value until the host proves
//! healthy again, and the final attempt of a retry budget always gets the
//! full maximum.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::engine::retry::RetryEngine;
use crate::error::{KnowledgeBaseError, RuleResult};
use crate::http::Entry;
use crate::kb::KnowledgeBase;
use crate::ruleset::Heuristic;

const KB_KEY: &str = "timeout_manager";

/// Rolling latency statistics and the timeout derivation.
pub struct TimeoutManager {
    min_timeout: f64,
    max_timeout: f64,
    sample_size: usize,
    request_delays: Vec<f64>,
    requests_successful: Vec<bool>,
    last_retry_timeout: Option<f64>,
}

impl TimeoutManager {
    pub fn new(min_timeout: Duration, max_timeout: Duration, sample_size: usize) -> Self {
        Self {
            min_timeout: min_timeout.as_secs_f64(),
            max_timeout: max_timeout.as_secs_f64(),
            sample_size,
            request_delays: Vec::new(),
            requests_successful: Vec::new(),
            last_retry_timeout: None,
        }
    }

    pub fn add_failed_request(&mut self, timeout_used: f64) {
        self.requests_successful.push(false);
        self.request_delays.push(timeout_used);
        self.last_retry_timeout = Some(match self.last_retry_timeout {
            Some(last) => last.max(timeout_used),
            None => timeout_used,
        });
    }

    pub fn add_successful_request(&mut self, delay: f64) {
        self.requests_successful.push(true);
        self.request_delays.push(delay);
    }

    pub fn get_timeout(&mut self) -> f64 {
        if self.request_delays.len() > self.sample_size * 5 {
            self.clean_up_data();
        }
        let timeout = if let Some(last) = self.last_retry_timeout {
            last * 2.0
        } else if self.request_delays.len() < self.sample_size {
            self.max_timeout * 0.8
        } else {
            let delays = &self.request_delays[self.request_delays.len() - self.sample_size..];
            mean(delays) * 2.0 + stdev(delays) * 4.0
        };
        timeout.max(self.min_timeout).min(self.max_timeout)
    }

    fn clean_up_data(&mut self) {
        if self.requests_successful.iter().all(|success| *success) {
            self.last_retry_timeout = None;
        }
        let keep = self.sample_size.min(self.request_delays.len());
        self.requests_successful = self
            .requests_successful
            .split_off(self.requests_successful.len() - keep);
        self.request_delays = self
            .request_delays
            .split_off(self.request_delays.len() - keep);
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let average = mean(values);
    let variance = values
        .iter()
        .map(|value| (value - average).powi(2))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Writes a statistics-driven timeout into each entry's arguments.
pub struct DynamicTimeout {
    max_timeout: Duration,
    retry_count: AtomicU32,
    manager: RwLock<Arc<Mutex<TimeoutManager>>>,
}

impl DynamicTimeout {
    pub fn new(min_timeout: Duration, max_timeout: Duration) -> Self {
        Self::with_sample_size(min_timeout, max_timeout, 200)
    }

    pub fn with_sample_size(
        min_timeout: Duration,
        max_timeout: Duration,
        sample_size: usize,
    ) -> Self {
        Self {
            max_timeout,
            retry_count: AtomicU32::new(0),
            manager: RwLock::new(Arc::new(Mutex::new(TimeoutManager::new(
                min_timeout,
                max_timeout,
                sample_size,
            )))),
        }
    }

    fn is_last_attempt(&self, entry: &Entry) -> bool {
        let retry_count = self.retry_count.load(Ordering::SeqCst);
        retry_count != 0 && entry.result.attempt > retry_count
    }
}

#[async_trait]
impl Heuristic for DynamicTimeout {
    async fn before_request(&self, entry: &mut Entry) -> RuleResult {
        let timeout = if self.is_last_attempt(entry) {
            // The last chance gets everything the configuration allows.
            self.max_timeout
        } else {
            let manager = self.manager.read().clone();
            let seconds = manager.lock().get_timeout();
            Duration::from_secs_f64(seconds)
        };
        entry.arguments.timeout = Some(timeout);
        entry.arguments.start_time = Some(Instant::now());
        Ok(())
    }

    async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        if let Some(start) = entry.arguments.start_time {
            let manager = self.manager.read().clone();
            manager
                .lock()
                .add_successful_request(start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    async fn on_timeout(&self, entry: &mut Entry) -> RuleResult {
        let timed_out_at = entry
            .arguments
            .timeout
            .unwrap_or(self.max_timeout)
            .as_secs_f64();
        let manager = self.manager.read().clone();
        manager.lock().add_failed_request(timed_out_at);
        Ok(())
    }

    fn set_engine(&self, engine: Arc<RetryEngine>) {
        self.retry_count.store(engine.retry_count(), Ordering::SeqCst);
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.manager.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.manager.write() = kb.get::<Mutex<TimeoutManager>>(KB_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::entry_for;

    fn manager(sample_size: usize) -> TimeoutManager {
        TimeoutManager::new(Duration::from_secs_f64(0.2), Duration::from_secs(10), sample_size)
    }

    #[test]
    fn few_samples_use_a_fraction_of_the_maximum() {
        let mut manager = manager(10);
        manager.add_successful_request(0.5);
        assert!((manager.get_timeout() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn full_window_uses_mean_and_deviation() {
        let mut manager = manager(4);
        for delay in [1.0, 1.0, 2.0, 2.0] {
            manager.add_successful_request(delay);
        }
        // mean 1.5 * 2 + stdev ~0.5774 * 4
        let expected = 3.0 + 0.577_350_269_189_625_8 * 4.0;
        assert!((manager.get_timeout() - expected).abs() < 1e-6);
    }

    #[test]
    fn timeout_is_clamped_to_bounds() {
        let mut manager_high = manager(2);
        manager_high.add_successful_request(100.0);
        manager_high.add_successful_request(200.0);
        assert!((manager_high.get_timeout() - 10.0).abs() < 1e-9);

        let mut manager_low = manager(2);
        manager_low.add_successful_request(0.001);
        manager_low.add_successful_request(0.001);
        assert!((manager_low.get_timeout() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn timed_out_value_is_doubled_for_later_attempts() {
        let mut manager = manager(10);
        manager.add_failed_request(3.0);
        assert!((manager.get_timeout() - 6.0).abs() < 1e-9);

        // The largest timed-out value wins.
        manager.add_failed_request(1.0);
        assert!((manager.get_timeout() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn cleanup_trims_the_window_and_forgets_old_timeouts() {
        let mut manager = manager(2);
        manager.add_failed_request(3.0);
        for _ in 0..12 {
            manager.add_successful_request(0.5);
        }
        // The first trim still sees the failure in the window, so the
        // timeout memory survives it.
        assert!((manager.get_timeout() - 6.0).abs() < 1e-9);
        assert!(manager.request_delays.len() <= 2);

        for _ in 0..9 {
            manager.add_successful_request(0.5);
        }
        // Everything recent succeeded: the memory clears and statistics
        // take over again.
        assert!((manager.get_timeout() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn before_request_writes_timeout_and_start_time() {
        let rule = DynamicTimeout::new(Duration::from_millis(200), Duration::from_secs(10));
        let mut entry = entry_for("http://example.com/a");
        rule.before_request(&mut entry).await.unwrap();
        assert_eq!(entry.arguments.timeout, Some(Duration::from_secs(8)));
        assert!(entry.arguments.start_time.is_some());
    }

    #[tokio::test]
    async fn last_attempt_gets_the_full_maximum() {
        let rule = DynamicTimeout::new(Duration::from_millis(200), Duration::from_secs(10));
        rule.retry_count.store(2, Ordering::SeqCst);

        let mut entry = entry_for("http://example.com/a");
        entry.result.attempt = 3;
        rule.before_request(&mut entry).await.unwrap();
        assert_eq!(entry.arguments.timeout, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn shared_manager_through_kb() {
        let kb = KnowledgeBase::new();
        let first = DynamicTimeout::new(Duration::from_millis(200), Duration::from_secs(10));
        first.set_kb(&kb).unwrap();

        let second = DynamicTimeout::new(Duration::from_millis(200), Duration::from_secs(10));
        assert!(matches!(
            second.set_kb(&kb),
            Err(KnowledgeBaseError::AlreadyBound(_))
        ));
        second.load_kb(&kb).unwrap();

        // A timeout recorded through one instance is visible to the other.
        let mut entry = entry_for("http://example.com/a");
        entry.arguments.timeout = Some(Duration::from_secs(3));
        first.on_timeout(&mut entry).await.unwrap();

        let mut probe = entry_for("http://example.com/b");
        second.before_request(&mut probe).await.unwrap();
        assert_eq!(probe.arguments.timeout, Some(Duration::from_secs(6)));
    }
}
