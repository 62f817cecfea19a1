//! Large-body cutoff.
//!
//! Keeps memory bounded on hosts serving huge files. When `Content-Length`
//! is announced, the value feeds a size model and the read cap is published
//! before the body is read; without it, oversized bodies are truncated
//! after the fact. The model starts from a fixed limit and, after enough
//! observations, switches to `mean + 5 * stdev` of the sizes seen.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::CONTENT_LENGTH;
use parking_lot::{Mutex, RwLock};

use crate::error::{KnowledgeBaseError, RuleResult};
use crate::http::Entry;
use crate::kb::KnowledgeBase;
use crate::ruleset::Heuristic;

const KB_KEY: &str = "body_size";

/// Observations collected before the limit is derived from statistics.
const CALIBRATION_SIZE: usize = 500;

/// Body size model.
pub struct BodySize {
    initial_limit: usize,
    collected_sizes: Vec<f64>,
    calculated_limit: Option<usize>,
}

impl BodySize {
    pub fn new(initial_limit: usize) -> Self {
        Self {
            initial_limit,
            collected_sizes: Vec::new(),
            calculated_limit: None,
        }
    }

    /// Limit in force right now.
    pub fn applicable_limit(&self) -> usize {
        self.calculated_limit.unwrap_or(self.initial_limit)
    }

    pub fn calculated_limit(&self) -> Option<usize> {
        self.calculated_limit
    }

    /// Feeds one observed body size into the model.
    pub fn add(&mut self, length: usize) {
        if self.calculated_limit.is_some() {
            return;
        }
        self.collected_sizes.push(length as f64);
        if self.collected_sizes.len() > CALIBRATION_SIZE {
            let average = mean(&self.collected_sizes);
            let deviation = stdev(&self.collected_sizes);
            let limit = (average + 5.0 * deviation) as usize;
            tracing::info!(limit, "updating max body size");
            self.calculated_limit = Some(limit);
        }
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

/// Caps how much of each body is read or kept.
pub struct IgnoreLargeBody {
    data: RwLock<Arc<Mutex<BodySize>>>,
}

impl IgnoreLargeBody {
    pub fn new() -> Self {
        Self::with_initial_limit(1024 * 1024)
    }

    pub fn with_initial_limit(initial_limit: usize) -> Self {
        Self {
            data: RwLock::new(Arc::new(Mutex::new(BodySize::new(initial_limit)))),
        }
    }
}

impl Default for IgnoreLargeBody {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heuristic for IgnoreLargeBody {
    async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        let Some(response) = &entry.response else {
            return Ok(());
        };
        let declared = response.headers.get(CONTENT_LENGTH);
        let data = self.data.read().clone();
        let mut data = data.lock();

        entry.result.read_length = match declared.and_then(|value| value.to_str().ok()) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(length) => {
                    data.add(length);
                    Some(data.applicable_limit())
                }
                Err(_) => {
                    tracing::debug!(value = raw, "bad content-length");
                    data.calculated_limit()
                }
            },
            None => data.calculated_limit(),
        };
        Ok(())
    }

    async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        // Only the unlimited-read case needs post-response statistics.
        if entry.result.read_length.is_some() {
            return Ok(());
        }
        let Some(response) = entry.response.as_mut() else {
            return Ok(());
        };
        let full_length = response.raw().len();
        let data = self.data.read().clone();
        let limit = {
            let mut data = data.lock();
            let limit = data.applicable_limit();
            data.add(full_length);
            limit
        };

        if full_length > limit {
            // Keep read_length coherent with the content for the other
            // heuristics working from it.
            response.truncate(limit);
            entry.result.read_length = Some(limit);
        }
        Ok(())
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.data.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.data.write() = kb.get::<Mutex<BodySize>>(KB_KEY)?;
        Ok(())
    }
}
