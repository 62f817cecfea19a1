//! Adaptive concurrency: resizable semaphore and the slow-start policy.
//!
//! [`ResizableSemaphore`] is a counted semaphore whose live permit count can
//! be adjusted at runtime. [`SlowStartPolicy`] drives it from observed
//! latencies: concurrency grows while the host keeps up, and the first
//! degradation while scaling up locks the discovered ceiling. The policy
//! never needs a configured target; it infers one from stable cohorts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// One aggregated latency measurement: the concurrency it was observed at
/// and the mean time waited per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cohort {
    pub scale: usize,
    pub average_wait: f64,
}

/// Provides the semaphore gating the general request lane and consumes the
/// latency of every completed request.
pub trait ScalingPolicy: Send + Sync {
    /// The semaphore requests must acquire before hitting the transport.
    fn semaphore(&self) -> &ResizableSemaphore;

    /// Records one observed request latency. Returns the concurrency in
    /// effect after the sample was absorbed.
    fn record(&self, duration: Duration) -> usize;

    /// Concurrency currently in effect.
    fn concurrency(&self) -> usize {
        self.semaphore().current()
    }
}

/// Fixed-size policy: the configured concurrency, no adjustment.
pub struct StaticPolicy {
    semaphore: ResizableSemaphore,
}

impl StaticPolicy {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: ResizableSemaphore::new(size, size, size),
        }
    }
}

impl ScalingPolicy for StaticPolicy {
    fn semaphore(&self) -> &ResizableSemaphore {
        &self.semaphore
    }

    fn record(&self, _duration: Duration) -> usize {
        self.semaphore.current()
    }
}

struct SlowStartState {
    cohort_count: usize,
    cohort_duration: f64,
    cohorts: Vec<Cohort>,
    /// The first cohort after any concurrency change is tainted and dropped.
    has_mutation: bool,
    increment: usize,
    ceiling_found: bool,
    target: Option<f64>,
}

/// Dynamic concurrency algorithm for large request volumes.
///
/// Latencies are aggregated into fixed-size cohorts. Cohorts immediately
/// following a concurrency change are discarded. Before the ceiling is
/// known, the mean of all stable cohorts forms the target; a cohort slower
/// than `target * (1 + tolerance)` shrinks concurrency, anything else grows
/// it. A slowdown observed right after scaling up declares the ceiling: the
/// maximum locks at the current level, one extra step down lets the host
/// recover, and further growth proceeds in single steps below the ceiling.
pub struct SlowStartPolicy {
    semaphore: ResizableSemaphore,
    cohort_size: usize,
    tolerance: f64,
    state: Mutex<SlowStartState>,
}

impl SlowStartPolicy {
    pub fn new(initial: usize) -> Self {
        Self::with_limits(initial, 1, 100, 200, 0.15)
    }

    pub fn with_limits(
        initial: usize,
        minimum: usize,
        maximum: usize,
        cohort_size: usize,
        tolerance: f64,
    ) -> Self {
        Self {
            semaphore: ResizableSemaphore::new(initial, minimum, maximum),
            cohort_size,
            tolerance,
            state: Mutex::new(SlowStartState {
                cohort_count: 0,
                cohort_duration: 0.0,
                cohorts: Vec::new(),
                // The initial state counts as a change; the first cohort is
                // discarded.
                has_mutation: true,
                increment: 2,
                ceiling_found: false,
                target: None,
            }),
        }
    }

    pub fn ceiling_found(&self) -> bool {
        self.state.lock().ceiling_found
    }

    fn adjust_scale(&self, state: &mut SlowStartState) -> bool {
        let len = state.cohorts.len();
        let previous = state.cohorts[len - 2];
        let current = state.cohorts[len - 1];

        if !state.ceiling_found {
            // All cohorts are relatively stable before the ceiling shows up;
            // average them for a smooth target. The newest cohort is left
            // out since it may well be the ceiling.
            let sum: f64 = state.cohorts[..len - 1].iter().map(|c| c.average_wait).sum();
            state.target = Some(sum / (len - 1) as f64);
        }

        let target = state.target.unwrap_or(current.average_wait);
        let upper_bound = target * (1.0 + self.tolerance);

        if current.average_wait > upper_bound && !self.semaphore.is_min() {
            self.semaphore.resize_down(state.increment);

            if !state.ceiling_found && previous.scale < current.scale {
                state.ceiling_found = true;
                state.increment = 1;

                self.semaphore.resize_down(1);
                self.semaphore.set_max_to_current();
            }
        } else if current.average_wait < upper_bound && !self.semaphore.is_max() {
            self.semaphore.resize_up(state.increment);
        }

        current.scale != self.semaphore.current()
    }
}

impl ScalingPolicy for SlowStartPolicy {
    fn semaphore(&self) -> &ResizableSemaphore {
        &self.semaphore
    }

    fn record(&self, duration: Duration) -> usize {
        let mut state = self.state.lock();
        state.cohort_duration += duration.as_secs_f64();
        state.cohort_count += 1;

        if state.cohort_count != self.cohort_size {
            return self.semaphore.current();
        }

        let tainted = state.has_mutation;
        if tainted {
            state.has_mutation = false;
        } else {
            let cohort = Cohort {
                scale: self.semaphore.current(),
                average_wait: state.cohort_duration / state.cohort_count as f64,
            };
            state.cohorts.push(cohort);
        }
        state.cohort_count = 0;
        state.cohort_duration = 0.0;

        if !tainted && state.cohorts.len() >= 2 {
            state.has_mutation = self.adjust_scale(&mut state);
        }
        drop(state);

        self.semaphore.current()
    }
}

struct Counts {
    minimum: usize,
    maximum: usize,
    current: usize,
    /// Deferred shrink: permits to destroy on the next releases instead of
    /// returning them to circulation.
    extra: usize,
}

impl Counts {
    fn clamp(&self, value: usize) -> usize {
        value.clamp(self.minimum, self.maximum)
    }
}

/// Counted semaphore whose active permit count is adjustable within
/// `[minimum, maximum]`.
///
/// Growing makes new permits available immediately. Shrinking consumes idle
/// permits right away; the remainder is recorded and destroyed as held
/// permits are released.
pub struct ResizableSemaphore {
    permits: Semaphore,
    counts: Mutex<Counts>,
}

impl ResizableSemaphore {
    pub fn new(initial: usize, minimum: usize, maximum: usize) -> Self {
        let current = initial.clamp(minimum, maximum);
        Self {
            permits: Semaphore::new(current),
            counts: Mutex::new(Counts {
                minimum,
                maximum,
                current,
                extra: 0,
            }),
        }
    }

    pub fn current(&self) -> usize {
        self.counts.lock().current
    }

    pub fn maximum(&self) -> usize {
        self.counts.lock().maximum
    }

    pub fn is_min(&self) -> bool {
        let counts = self.counts.lock();
        counts.current == counts.minimum
    }

    pub fn is_max(&self) -> bool {
        let counts = self.counts.lock();
        counts.current == counts.maximum
    }

    /// Locks the ceiling at the current level.
    pub fn set_max_to_current(&self) {
        let mut counts = self.counts.lock();
        counts.maximum = counts.current;
    }

    /// Raises capacity by up to `quantity`, bounded by the maximum. New
    /// permits become available immediately.
    pub fn resize_up(&self, quantity: usize) {
        let added = {
            let mut counts = self.counts.lock();
            let target = counts.clamp(counts.current.saturating_add(quantity));
            let added = target.saturating_sub(counts.current);
            counts.current = target;
            added
        };
        if added > 0 {
            self.permits.add_permits(added);
        }
    }

    /// Lowers capacity by up to `quantity`, bounded by the minimum. Idle
    /// permits are consumed now; the rest is destroyed on release.
    pub fn resize_down(&self, quantity: usize) {
        let mut counts = self.counts.lock();
        let target = counts.clamp(counts.current.saturating_sub(quantity));
        while counts.current > target {
            match self.permits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => counts.extra += 1,
            }
            counts.current -= 1;
        }
    }

    /// Blocks until a permit is available. The permit is returned when the
    /// guard drops.
    pub async fn acquire(&self) -> SemaphoreGuard<'_> {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = self
            .permits
            .acquire()
            .await
            .expect("resizable semaphore is never closed");
        permit.forget();
        SemaphoreGuard { semaphore: self }
    }

    fn release(&self) {
        {
            let mut counts = self.counts.lock();
            if counts.extra > 0 {
                // A shrink is pending; destroy the permit instead of putting
                // it back in circulation.
                counts.extra -= 1;
                return;
            }
        }
        self.permits.add_permits(1);
    }

    /// Permits available for immediate acquisition.
    pub fn idle_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Releases one permit of its [`ResizableSemaphore`] when dropped.
pub struct SemaphoreGuard<'a> {
    semaphore: &'a ResizableSemaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Shared handle alias used where a policy is injected.
pub type SharedPolicy = Arc<dyn ScalingPolicy>;
