//! Catch-all redirect rejection.
//!
//! Some directories redirect every URL under them to the same place (a
//! login page, the site root). Before a redirect is trusted, a random
//! sibling URL under the same directory is probed through the priority
//! lane; when its redirect destination, with the requested path substituted
//! by a marker, matches the observed one, the observed redirect carries no
//! information and the request is rejected. Probe results are cached per
//! directory and shared through the knowledge base.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use url::Url;
use uuid::Uuid;

use crate::engine::retry::RetryEngine;
use crate::error::{HammerTimeError, KnowledgeBaseError, RuleResult};
use crate::http::{Entry, Request};
use crate::kb::KnowledgeBase;
use crate::ruleset::{Heuristic, Heuristics};
use crate::rules::redirects::is_redirect;

const KB_KEY: &str = "default_redirects";

/// Stands in for the requested path when destinations are compared.
const PATH_MARKER: &str = "%path%";

/// Default redirect destination per directory; `None` records a directory
/// whose random sibling did not redirect.
type RedirectTargets = DashMap<String, Option<String>>;

/// Rejects redirects that a directory serves for any path under it.
pub struct RejectCatchAllRedirect {
    engine: OnceCell<Arc<RetryEngine>>,
    child_heuristics: RwLock<Option<Arc<Heuristics>>>,
    targets: RwLock<Arc<RedirectTargets>>,
    probing: DashMap<String, Arc<tokio::sync::OnceCell<Option<String>>>>,
}

impl RejectCatchAllRedirect {
    pub fn new() -> Self {
        Self {
            engine: OnceCell::new(),
            child_heuristics: RwLock::new(None),
            targets: RwLock::new(Arc::new(RedirectTargets::default())),
            probing: DashMap::new(),
        }
    }

    /// The directory's default redirect destination, probed once per
    /// directory with a random sibling URL.
    async fn default_redirect_for(&self, directory: &Url) -> Result<Option<String>, HammerTimeError> {
        let key = directory.to_string();
        let targets = self.targets.read().clone();
        if let Some(known) = targets.get(&key) {
            return Ok(known.clone());
        }

        let cell = self.probing.entry(key.clone()).or_default().clone();
        let template = cell
            .get_or_try_init(|| async {
                let template = self.probe_directory(directory).await?;
                targets.insert(key.clone(), template.clone());
                Ok::<_, HammerTimeError>(template)
            })
            .await?
            .clone();
        Ok(template)
    }

    async fn probe_directory(&self, directory: &Url) -> Result<Option<String>, HammerTimeError> {
        let engine = self.engine.get().ok_or(HammerTimeError::Cancelled)?;
        let probe_url = directory
            .join(&Uuid::new_v4().to_string())
            .map_err(|_| HammerTimeError::reject("Cannot build probe URL"))?;

        let child = self.child_heuristics.read().clone();
        let mut probe = Entry::new(Request::new(probe_url.clone()));
        match engine.perform_high_priority(&mut probe, child.as_ref()).await {
            Ok(()) => {}
            // A transient probe failure retries the whole request later.
            Err(error @ HammerTimeError::Stop(_)) => return Err(error),
            // The probe was filtered; nothing is known about the directory.
            Err(_) => return Ok(None),
        }

        let template = probe
            .response
            .as_ref()
            .filter(|response| is_redirect(response.code))
            .and_then(|response| response.headers.get(http::header::LOCATION))
            .and_then(|value| value.to_str().ok())
            .map(|location| normalize_destination(&probe_url, location));
        Ok(template)
    }
}

impl Default for RejectCatchAllRedirect {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heuristic for RejectCatchAllRedirect {
    async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        let Some(response) = &entry.response else {
            return Ok(());
        };
        if !is_redirect(response.code) {
            return Ok(());
        }
        let Some(location) = response
            .headers
            .get(http::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
        else {
            // Left for the follow-redirects rule to reject.
            return Ok(());
        };

        let url = entry.request.url.clone();
        let directory = url
            .join("./")
            .map_err(|_| HammerTimeError::reject("Cannot derive containing directory"))?;
        let Some(template) = self.default_redirect_for(&directory).await? else {
            return Ok(());
        };

        if normalize_destination(&url, &location) == template {
            return Err(HammerTimeError::reject(format!(
                "{url} redirected to a catch-all redirect"
            )));
        }
        Ok(())
    }

    fn set_engine(&self, engine: Arc<RetryEngine>) {
        let _ = self.engine.set(engine);
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.targets.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.targets.write() = kb.get::<RedirectTargets>(KB_KEY)?;
        Ok(())
    }

    fn set_child_heuristics(&self, child: Arc<Heuristics>) {
        *self.child_heuristics.write() = Some(child);
    }
}

/// Resolves `location` against `requested` and substitutes the requested
/// path with a marker, so destinations that merely echo the path compare
/// equal.
fn normalize_destination(requested: &Url, location: &str) -> String {
    let absolute = requested
        .join(location)
        .map(|resolved| resolved.to_string())
        .unwrap_or_else(|_| location.to_string());
    let path = requested.path();
    if path.len() > 1 {
        absolute.replace(path, PATH_MARKER)
    } else {
        absolute
    }
}
