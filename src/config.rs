//! Engine construction and the standard detection stack.
//!
//! [`HammerTimeBuilder`] wires the transport, knowledge base, scaling
//! policy and retry settings into a ready facade. [`DetectionStack`]
//! registers the built-in heuristics in their intended order for callers
//! that want the full detection behavior without assembling it by hand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::core::{HammerTime, Stats};
use crate::engine::Engine;
use crate::engine::retry::RetryEngine;
use crate::engine::scaling::{ScalingPolicy, StaticPolicy};
use crate::error::KnowledgeBaseError;
use crate::kb::KnowledgeBase;
use crate::ruleset::{Heuristic, Heuristics};
use crate::scheduler::{DEFAULT_LIMIT, RequestScheduler};
use crate::rules::{
    ContentHashSampling, ContentSampleSampling, ContentSimhashSampling, DeadHostDetection,
    DetectBehaviorChange, DetectSoft404, DynamicTimeout, FollowRedirects, IgnoreLargeBody,
    RejectErrorBehavior, RejectSoft404,
};

/// Fluent configuration for [`HammerTime`].
pub struct HammerTimeBuilder {
    engine: Option<Arc<dyn Engine>>,
    kb: Option<Arc<KnowledgeBase>>,
    policy: Option<Arc<dyn ScalingPolicy>>,
    retry_count: u32,
    retry_delay: Duration,
    proxy: Option<Url>,
    scheduler_limit: usize,
}

impl HammerTimeBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            kb: None,
            policy: None,
            retry_count: 0,
            retry_delay: Duration::from_secs(1),
            proxy: None,
            scheduler_limit: DEFAULT_LIMIT,
        }
    }

    /// The transport performing the actual HTTP calls. Required.
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Shares a knowledge base with another engine instance.
    pub fn kb(mut self, kb: Arc<KnowledgeBase>) -> Self {
        self.kb = Some(kb);
        self
    }

    /// Concurrency policy for the general lane. Defaults to a static
    /// 50-permit semaphore.
    pub fn policy(mut self, policy: Arc<dyn ScalingPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Additional attempts granted after a retriable failure.
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Pause between attempts.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Cap on simultaneously running request tasks.
    pub fn scheduler_limit(mut self, limit: usize) -> Self {
        self.scheduler_limit = limit;
        self
    }

    pub fn build(self) -> Result<Arc<HammerTime>> {
        let transport = self.engine.context("a transport engine is required")?;
        let stats = Arc::new(Stats::new());
        let kb = self.kb.unwrap_or_else(|| Arc::new(KnowledgeBase::new()));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(StaticPolicy::new(50)));

        let engine = Arc::new(RetryEngine::new(
            transport,
            policy,
            stats.clone(),
            self.retry_count,
            self.retry_delay,
        ));
        if let Some(proxy) = self.proxy {
            engine.set_proxy(Some(proxy));
        }
        let heuristics = Arc::new(Heuristics::new(kb.clone(), Some(engine.clone())));

        Ok(Arc::new(HammerTime::from_parts(
            stats,
            kb,
            engine,
            heuristics,
            RequestScheduler::new(self.scheduler_limit),
        )))
    }
}

impl Default for HammerTimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Knobs of the standard detection rules.
pub struct DetectionStack {
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub dead_host_threshold: u64,
    pub max_redirect: usize,
    pub confirmation_factor: usize,
}

impl Default for DetectionStack {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_millis(200),
            max_timeout: Duration::from_secs(10),
            dead_host_threshold: 50,
            max_redirect: 15,
            confirmation_factor: 1,
        }
    }
}

impl DetectionStack {
    /// Registers the standard rules on `engine`'s pipeline, in order:
    /// timeout, dead-host, body cutoff, sampling, redirects, soft-404 and
    /// behavior change. Behavior change runs after the soft-404 verdict so
    /// catch-all pages stay out of its buffer.
    pub fn install(&self, engine: &HammerTime) -> Result<(), KnowledgeBaseError> {
        let rules: Vec<Arc<dyn Heuristic>> = vec![
            Arc::new(DynamicTimeout::new(self.min_timeout, self.max_timeout)),
            Arc::new(DeadHostDetection::with_threshold(self.dead_host_threshold)),
            Arc::new(IgnoreLargeBody::new()),
            Arc::new(ContentHashSampling),
            Arc::new(ContentSimhashSampling::default()),
            Arc::new(ContentSampleSampling::default()),
            Arc::new(FollowRedirects::with_max_redirect(self.max_redirect)),
            Arc::new(
                DetectSoft404::new().with_confirmation_factor(self.confirmation_factor),
            ),
            Arc::new(RejectSoft404),
            Arc::new(DetectBehaviorChange::new()),
            Arc::new(RejectErrorBehavior),
        ];
        engine.heuristics().add_multiple(rules)
    }
}
