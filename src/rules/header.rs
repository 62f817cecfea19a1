//! Fixed header injection.

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};

use crate::error::RuleResult;
use crate::http::Entry;
use crate::ruleset::Heuristic;

/// Sets a header on every outgoing request, replacing any existing value.
pub struct SetHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetHeader {
    pub fn new(name: HeaderName, value: HeaderValue) -> Self {
        Self { name, value }
    }
}

#[async_trait]
impl Heuristic for SetHeader {
    async fn before_request(&self, entry: &mut Entry) -> RuleResult {
        entry
            .request
            .headers
            .insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}
