//! Heuristic pipeline: ordered async hooks around each request.
//!
//! A [`Heuristics`] object holds one ordered [`RuleSet`] per lifecycle
//! event. Rules run sequentially in registration order for a given event; a
//! rule that fails terminates the event's chain for that entry. Rules are
//! oblivious to one another and coordinate only through the shared
//! [`KnowledgeBase`] and the [`Entry`] itself.
//!
//! Registration wires capabilities in a fixed order: the rule receives the
//! engine handle, then attempts to publish its shared state to the knowledge
//! base (adopting the existing state instead when the key is already bound),
//! and finally receives a freshly built child pipeline sharing the same
//! knowledge base and engine, for rules that spawn sub-requests.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::engine::retry::RetryEngine;
use crate::error::{KnowledgeBaseError, RuleResult};
use crate::http::Entry;
use crate::kb::KnowledgeBase;

/// Lifecycle events a rule can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BeforeRequest,
    AfterHeaders,
    AfterResponse,
    OnRequestSuccessful,
    OnTimeout,
    OnHostUnreachable,
}

/// A pipeline rule.
///
/// Every hook defaults to a no-op, so a rule implements only the events it
/// cares about. The capability methods are invoked once, at registration:
///
/// * [`set_engine`](Heuristic::set_engine) hands over the retry-engine
///   handle, used by rules that issue internal probe requests;
/// * [`set_kb`](Heuristic::set_kb) publishes the rule's shared state; when
///   the key is already bound, [`load_kb`](Heuristic::load_kb) is called
///   instead so the rule adopts the existing state;
/// * [`set_child_heuristics`](Heuristic::set_child_heuristics) hands over a
///   child pipeline for sub-requests.
#[async_trait]
pub trait Heuristic: Send + Sync {
    async fn before_request(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    async fn after_headers(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    async fn after_response(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    async fn on_request_successful(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    async fn on_timeout(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    async fn on_host_unreachable(&self, _entry: &mut Entry) -> RuleResult {
        Ok(())
    }

    fn set_engine(&self, _engine: Arc<RetryEngine>) {}

    fn set_kb(&self, _kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        Ok(())
    }

    fn load_kb(&self, _kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        Ok(())
    }

    fn set_child_heuristics(&self, _child: Arc<Heuristics>) {}
}

/// Boxed hook bound to one rule and one event.
type Hook = Arc<dyn for<'a> Fn(&'a mut Entry) -> BoxFuture<'a, RuleResult> + Send + Sync>;

/// Ordered list of hooks for one lifecycle event.
#[derive(Default, Clone)]
pub struct RuleSet {
    rules: Vec<Hook>,
}

impl RuleSet {
    fn add(&mut self, hook: Hook) {
        self.rules.push(hook);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs every hook in order; the first failure aborts the chain.
    pub async fn accept(&self, entry: &mut Entry) -> RuleResult {
        for hook in &self.rules {
            hook(entry).await?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
struct EventRules {
    before_request: RuleSet,
    after_headers: RuleSet,
    after_response: RuleSet,
    on_request_successful: RuleSet,
    on_timeout: RuleSet,
    on_host_unreachable: RuleSet,
}

/// The per-facade rule pipeline.
pub struct Heuristics {
    kb: Arc<KnowledgeBase>,
    engine: RwLock<Option<Arc<RetryEngine>>>,
    rulesets: RwLock<EventRules>,
}

impl Heuristics {
    /// Creates an empty pipeline over `kb`. The engine handle is forwarded
    /// to every rule registered afterwards.
    pub fn new(kb: Arc<KnowledgeBase>, engine: Option<Arc<RetryEngine>>) -> Self {
        Self {
            kb,
            engine: RwLock::new(engine),
            rulesets: RwLock::new(EventRules::default()),
        }
    }

    /// The shared knowledge base.
    pub fn kb(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// Builds a child pipeline sharing this pipeline's knowledge base and
    /// engine. Used by rules that spawn sub-requests.
    pub fn child(&self) -> Arc<Heuristics> {
        Arc::new(Heuristics::new(self.kb.clone(), self.engine.read().clone()))
    }

    /// Registers a rule, wiring its capabilities and appending its hooks to
    /// every event's rule set.
    pub fn add(&self, rule: Arc<dyn Heuristic>) -> Result<(), KnowledgeBaseError> {
        if let Some(engine) = self.engine.read().clone() {
            rule.set_engine(engine);
        }
        match rule.set_kb(&self.kb) {
            Err(KnowledgeBaseError::AlreadyBound(_)) => rule.load_kb(&self.kb)?,
            other => other?,
        }
        rule.set_child_heuristics(self.child());

        let mut rulesets = self.rulesets.write();
        rulesets.before_request.add(hook(&rule, Event::BeforeRequest));
        rulesets.after_headers.add(hook(&rule, Event::AfterHeaders));
        rulesets.after_response.add(hook(&rule, Event::AfterResponse));
        rulesets
            .on_request_successful
            .add(hook(&rule, Event::OnRequestSuccessful));
        rulesets.on_timeout.add(hook(&rule, Event::OnTimeout));
        rulesets
            .on_host_unreachable
            .add(hook(&rule, Event::OnHostUnreachable));
        Ok(())
    }

    /// Registers several rules in order.
    pub fn add_multiple<I>(&self, rules: I) -> Result<(), KnowledgeBaseError>
    where
        I: IntoIterator<Item = Arc<dyn Heuristic>>,
    {
        for rule in rules {
            self.add(rule)?;
        }
        Ok(())
    }

    pub async fn before_request(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().before_request.clone();
        rules.accept(entry).await
    }

    pub async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().after_headers.clone();
        rules.accept(entry).await
    }

    pub async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().after_response.clone();
        rules.accept(entry).await
    }

    pub async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().on_request_successful.clone();
        rules.accept(entry).await
    }

    pub async fn on_timeout(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().on_timeout.clone();
        rules.accept(entry).await
    }

    pub async fn on_host_unreachable(&self, entry: &mut Entry) -> RuleResult {
        let rules = self.rulesets.read().on_host_unreachable.clone();
        rules.accept(entry).await
    }
}

fn hook(rule: &Arc<dyn Heuristic>, event: Event) -> Hook {
    let rule = rule.clone();
    Arc::new(move |entry: &mut Entry| -> BoxFuture<'_, RuleResult> {
        let rule = rule.clone();
        Box::pin(async move {
            match event {
                Event::BeforeRequest => rule.before_request(entry).await,
                Event::AfterHeaders => rule.after_headers(entry).await,
                Event::AfterResponse => rule.after_response(entry).await,
                Event::OnRequestSuccessful => rule.on_request_successful(entry).await,
                Event::OnTimeout => rule.on_timeout(entry).await,
                Event::OnHostUnreachable => rule.on_host_unreachable(entry).await,
            }
        })
    })
}
