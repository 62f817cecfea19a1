//! URL allow/deny filtering ahead of the transport.

use async_trait::async_trait;
use regex::Regex;

use crate::error::{HammerTimeError, RuleResult};
use crate::http::Entry;
use crate::ruleset::Heuristic;

enum FilterMode {
    Allow(Vec<Regex>),
    Deny(Vec<Regex>),
}

/// Rejects requests whose URL falls outside the allow list, or inside the
/// deny list. Patterns are regular expressions searched anywhere in the
/// full URL.
pub struct FilterRequestFromURL {
    mode: FilterMode,
}

impl FilterRequestFromURL {
    /// Only URLs matching at least one pattern pass.
    pub fn allow_list<'a, I>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        Ok(Self {
            mode: FilterMode::Allow(compile(patterns)?),
        })
    }

    /// URLs matching any pattern are rejected.
    pub fn deny_list<'a, I>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        Ok(Self {
            mode: FilterMode::Deny(compile(patterns)?),
        })
    }
}

fn compile<'a, I>(patterns: I) -> Result<Vec<Regex>, regex::Error>
where
    I: IntoIterator<Item = &'a str>,
{
    patterns.into_iter().map(Regex::new).collect()
}

#[async_trait]
impl Heuristic for FilterRequestFromURL {
    async fn before_request(&self, entry: &mut Entry) -> RuleResult {
        let url = entry.request.url.as_str();
        match &self.mode {
            FilterMode::Allow(patterns) => {
                if !patterns.iter().any(|pattern| pattern.is_match(url)) {
                    return Err(HammerTimeError::reject(format!(
                        "Request URL {url} is not in whitelist patterns"
                    )));
                }
            }
            FilterMode::Deny(patterns) => {
                if patterns.iter().any(|pattern| pattern.is_match(url)) {
                    return Err(HammerTimeError::reject(format!(
                        "Request URL {url} is in blacklist patterns"
                    )));
                }
            }
        }
        Ok(())
    }
}
