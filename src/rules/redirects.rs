//! Bounded redirect following.
//!
//! Redirect responses are chased through the priority lane with a child
//! heuristic pipeline, hop by hop, until a non-redirect lands or the budget
//! runs out. Every hop appends a full clone of the entry at that point to
//! `result.redirects`, the original entry first, so the caller sees the
//! whole chain.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::engine::retry::RetryEngine;
use crate::error::{HammerTimeError, RuleResult};
use crate::http::{Entry, Request};
use crate::ruleset::{Heuristic, Heuristics};

/// Status codes treated as redirects.
pub const VALID_REDIRECTS: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

pub(crate) fn is_redirect(code: StatusCode) -> bool {
    VALID_REDIRECTS.contains(&code)
}

/// Follows up to `max_redirect` redirects on successful responses.
pub struct FollowRedirects {
    max_redirect: usize,
    engine: OnceCell<Arc<RetryEngine>>,
    child_heuristics: RwLock<Option<Arc<Heuristics>>>,
}

impl FollowRedirects {
    pub fn new() -> Self {
        Self::with_max_redirect(15)
    }

    pub fn with_max_redirect(max_redirect: usize) -> Self {
        Self {
            max_redirect,
            engine: OnceCell::new(),
            child_heuristics: RwLock::new(None),
        }
    }

    /// Pipeline applied to the follow-up requests; rules can be added to it
    /// after registration.
    pub fn child_heuristics(&self) -> Option<Arc<Heuristics>> {
        self.child_heuristics.read().clone()
    }
}

impl Default for FollowRedirects {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heuristic for FollowRedirects {
    async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        let Some(code) = entry.response.as_ref().map(|response| response.code) else {
            return Ok(());
        };
        if !is_redirect(code) {
            return Ok(());
        }
        let engine = self
            .engine
            .get()
            .cloned()
            .ok_or(HammerTimeError::Cancelled)?;
        let child = self.child_heuristics.read().clone();

        // The chain starts with the entry as it stood when the first
        // redirect came in.
        entry.result.redirects.push(entry.clone());

        let mut current_url = entry.request.url.clone();
        let mut hops = 0;
        while let Some(code) = entry.response.as_ref().map(|response| response.code) {
            if !is_redirect(code) {
                break;
            }
            if hops >= self.max_redirect {
                return Err(HammerTimeError::reject(format!(
                    "Max redirect limit reached for {}",
                    entry.request.url
                )));
            }
            let location = entry
                .response
                .as_ref()
                .and_then(|response| response.headers.get(http::header::LOCATION))
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| {
                    HammerTimeError::reject(format!(
                        "Redirect for {} has no location header",
                        entry.request.url
                    ))
                })?
                .to_string();
            let next_url = current_url.join(&location).map_err(|_| {
                HammerTimeError::reject(format!("Invalid redirect location: {location}"))
            })?;

            let stats = engine.stats().clone();
            stats.add_requested();
            let mut follow_up = Entry::new(Request::new(next_url.clone()));
            let outcome = engine
                .perform_high_priority(&mut follow_up, child.as_ref())
                .await;
            stats.add_completed();
            outcome?;

            entry.result.redirects.push(follow_up.clone());
            entry.response = follow_up.response;
            current_url = next_url;
            hops += 1;
        }
        Ok(())
    }

    fn set_engine(&self, engine: Arc<RetryEngine>) {
        let _ = self.engine.set(engine);
    }

    fn set_child_heuristics(&self, child: Arc<Heuristics>) {
        *self.child_heuristics.write() = Some(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stats;
    use crate::engine::scaling::StaticPolicy;
    use crate::testing::{FakeEngine, FakeStep, entry_for};
    use bytes::Bytes;
    use http::HeaderMap;
    use std::time::Duration;

    fn wire(rule: FollowRedirects, transport: Arc<FakeEngine>) -> (Arc<dyn Heuristic>, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let engine = Arc::new(RetryEngine::new(
            transport,
            Arc::new(StaticPolicy::new(10)),
            stats.clone(),
            0,
            Duration::from_millis(1),
        ));
        let kb = Arc::new(crate::kb::KnowledgeBase::new());
        let heuristics = Arc::new(Heuristics::new(kb, Some(engine)));
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();
        (rule, stats)
    }

    fn redirect_entry(url: &str, code: u16, location: &str) -> Entry {
        let mut entry = entry_for(url);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::LOCATION, location.parse().unwrap());
        let mut response =
            crate::http::Response::new(StatusCode::from_u16(code).unwrap(), headers);
        response.set_content(Bytes::new(), true);
        entry.response = Some(response);
        entry
    }

    #[tokio::test]
    async fn chain_is_followed_to_the_final_response() {
        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::redirect(302, "/b"),
            FakeStep::ok("landed"),
        ]));
        let (rule, stats) = wire(FollowRedirects::with_max_redirect(5), transport);

        let mut entry = redirect_entry("http://example.com/start", 302, "/a");
        rule.on_request_successful(&mut entry).await.unwrap();

        let response = entry.response.as_ref().unwrap();
        assert_eq!(response.code, StatusCode::OK);
        assert_eq!(entry.result.redirects.len(), 3);
        assert_eq!(
            entry.result.redirects[0].request.url.as_str(),
            "http://example.com/start"
        );
        assert!(entry.result.redirects[2].request.url.as_str().ends_with("/b"));
        // Follow-up requests are accounted for.
        assert_eq!(stats.requested(), 2);
        assert_eq!(stats.completed(), 2);
    }

    #[tokio::test]
    async fn non_redirect_responses_are_left_alone() {
        let transport = Arc::new(FakeEngine::ok());
        let (rule, _) = wire(FollowRedirects::new(), transport.clone());

        let mut entry = crate::testing::entry_with_response("http://example.com/a", 200, "fine");
        rule.on_request_successful(&mut entry).await.unwrap();
        assert!(entry.result.redirects.is_empty());
        assert_eq!(transport.perform_count(), 0);
    }

    #[tokio::test]
    async fn missing_location_is_rejected() {
        let transport = Arc::new(FakeEngine::ok());
        let (rule, _) = wire(FollowRedirects::new(), transport);

        let mut entry = entry_for("http://example.com/x");
        let mut response = crate::http::Response::new(StatusCode::FOUND, HeaderMap::new());
        response.set_content(Bytes::new(), true);
        entry.response = Some(response);

        let result = rule.on_request_successful(&mut entry).await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));
    }

    #[tokio::test]
    async fn budget_of_hops_is_enforced() {
        // Two hops available, two hops needed: fine.
        let transport = Arc::new(FakeEngine::scripted([
            FakeStep::redirect(301, "/hop2"),
            FakeStep::ok("done"),
        ]));
        let (rule, _) = wire(FollowRedirects::with_max_redirect(2), transport);
        let mut entry = redirect_entry("http://example.com/start", 301, "/hop1");
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(entry.result.redirects.len(), 3);

        // Budget exceeded by one: rejected.
        let endless = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::redirect(302, "/again")
        }));
        let (rule, _) = wire(FollowRedirects::with_max_redirect(2), endless);
        let mut entry = redirect_entry("http://example.com/start", 302, "/again");
        let result = rule.on_request_successful(&mut entry).await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));
        // Chain length never exceeds max_redirect + 1.
        assert!(entry.result.redirects.len() <= 3);
    }

    #[tokio::test]
    async fn relative_locations_resolve_against_the_previous_hop() {
        let transport = Arc::new(FakeEngine::scripted([FakeStep::ok("deep")]));
        let (rule, _) = wire(FollowRedirects::new(), transport.clone());

        let mut entry = redirect_entry("http://example.com/a/b/c", 303, "sibling");
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(
            transport.performed.lock()[0].as_str(),
            "http://example.com/a/b/sibling"
        );
    }
}
