//! Behavior-change detection.
//!
//! Keeps a sliding buffer of response fingerprints. When every page in the
//! buffer looks like the current one, the server has stopped returning
//! distinct content (error pages, throttling interstitials) and requests
//! are flagged until variety returns. Runs after the soft-404 verdict so a
//! page already identified as a catch-all never poisons the buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::{Mutex, RwLock};

use crate::error::{HammerTimeError, KnowledgeBaseError, RuleResult};
use crate::http::Entry;
use crate::kb::KnowledgeBase;
use crate::ruleset::Heuristic;
use crate::rules::simhash::{DEFAULT_TOKEN_SIZE, Simhash};

const KB_KEY: &str = "behavior_buffer";

struct BehaviorState {
    previous_responses: VecDeque<u64>,
    error_behavior: bool,
}

/// Flags entries once the server starts answering everything with the same
/// page.
pub struct DetectBehaviorChange {
    safe_status_codes: Vec<StatusCode>,
    buffer_size: usize,
    match_threshold: u32,
    token_size: usize,
    state: RwLock<Arc<Mutex<BehaviorState>>>,
}

impl DetectBehaviorChange {
    pub fn new() -> Self {
        Self::with_settings(10, 5)
    }

    pub fn with_settings(buffer_size: usize, match_threshold: u32) -> Self {
        Self {
            // Those codes are legitimate repeated answers and say nothing
            // about the server's health.
            safe_status_codes: vec![
                StatusCode::UNAUTHORIZED,
                StatusCode::FORBIDDEN,
                StatusCode::NOT_FOUND,
            ],
            buffer_size,
            match_threshold,
            token_size: DEFAULT_TOKEN_SIZE,
            state: RwLock::new(Arc::new(Mutex::new(BehaviorState {
                previous_responses: VecDeque::new(),
                error_behavior: false,
            }))),
        }
    }
}

impl Default for DetectBehaviorChange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heuristic for DetectBehaviorChange {
    async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        // Soft-404 pages are expected repeats; keep them out of the buffer.
        if entry.result.soft404 == Some(true) {
            return Ok(());
        }
        let Some(response) = &entry.response else {
            return Ok(());
        };
        if self.safe_status_codes.contains(&response.code) {
            entry.result.error_behavior = Some(false);
            return Ok(());
        }

        let fingerprint = Simhash::with_token_size(&response.text_lossy(), self.token_size);
        let state = self.state.read().clone();
        let mut state = state.lock();

        if state.previous_responses.len() >= self.buffer_size {
            let all_alike = state
                .previous_responses
                .iter()
                .all(|value| fingerprint.distance(&Simhash::from_value(*value)) < self.match_threshold);
            state.error_behavior = all_alike;
            state.previous_responses.pop_front();
        }
        state.previous_responses.push_back(fingerprint.value());
        entry.result.error_behavior = Some(state.error_behavior);
        Ok(())
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.state.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.state.write() = kb.get::<Mutex<BehaviorState>>(KB_KEY)?;
        Ok(())
    }
}

/// Turns a positive behavior-change verdict into a rejection.
#[derive(Default)]
pub struct RejectErrorBehavior;

#[async_trait]
impl Heuristic for RejectErrorBehavior {
    async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        if entry.result.error_behavior == Some(true) {
            return Err(HammerTimeError::reject("Error behavior detected"));
        }
        Ok(())
    }
}
