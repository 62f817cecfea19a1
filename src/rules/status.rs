//! Status-code based rejection.

use std::collections::HashSet;
use std::ops::Range;

use async_trait::async_trait;

use crate::error::{HammerTimeError, RuleResult};
use crate::http::Entry;
use crate::ruleset::Heuristic;

/// Rejects responses as soon as their status code is in the configured set.
#[derive(Default)]
pub struct RejectStatusCode {
    reject_set: HashSet<u16>,
}

impl RejectStatusCode {
    /// Builds a rule rejecting every code of the given ranges.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = Range<u16>>,
    {
        Self {
            reject_set: ranges.into_iter().flatten().collect(),
        }
    }

    /// Builds a rule rejecting the listed codes.
    pub fn from_codes<I>(codes: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        Self {
            reject_set: codes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Heuristic for RejectStatusCode {
    async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        if let Some(response) = &entry.response {
            if self.reject_set.contains(&response.code.as_u16()) {
                return Err(HammerTimeError::reject(format!(
                    "Status code reject: {}",
                    response.code
                )));
            }
        }
        Ok(())
    }
}
