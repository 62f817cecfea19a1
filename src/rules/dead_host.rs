//! Dead-host detection.
//!
//! Per-host failure accounting with a shared synchronization point: once a
//! host looks unhealthy, retry attempts park on the host's health channel
//! instead of piling more load on it. A successful header delivery releases
//! them; crossing the timeout threshold, or seeing every known request time
//! out, declares the host dead and fails the waiters with the same error.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use url::Url;

use crate::error::{HammerTimeError, KnowledgeBaseError, RuleResult};
use crate::http::Entry;
use crate::kb::KnowledgeBase;
use crate::ruleset::Heuristic;

const KB_KEY: &str = "host_health";

/// Default number of timeouts tolerated per host.
pub const DEFAULT_THRESHOLD: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostHealth {
    /// The host recently timed out; retries hold until this resolves.
    Pending,
    Alive,
    Offline,
}

struct HostEntry {
    request_count: u64,
    timeout_requests: u64,
    health: watch::Sender<HostHealth>,
}

impl HostEntry {
    fn new() -> Self {
        let (health, _) = watch::channel(HostHealth::Alive);
        Self {
            request_count: 0,
            timeout_requests: 0,
            health,
        }
    }
}

type HostMap = DashMap<String, HostEntry>;

/// Short-circuits requests against hosts that stopped answering.
pub struct DeadHostDetection {
    threshold: u64,
    hosts: RwLock<Arc<HostMap>>,
}

impl DeadHostDetection {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            hosts: RwLock::new(Arc::new(HostMap::default())),
        }
    }

    fn offline(host: &str) -> HammerTimeError {
        HammerTimeError::OfflineHost(host.to_string())
    }
}

impl Default for DeadHostDetection {
    fn default() -> Self {
        Self::new()
    }
}

fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[async_trait]
impl Heuristic for DeadHostDetection {
    async fn before_request(&self, entry: &mut Entry) -> RuleResult {
        let host = host_key(&entry.request.url);
        let hosts = self.hosts.read().clone();

        let waiter = {
            let mut state = hosts.entry(host.clone()).or_insert_with(HostEntry::new);
            if *state.health.borrow() == HostHealth::Offline {
                return Err(Self::offline(&host));
            }
            if entry.result.attempt == 1 {
                state.request_count += 1;
                None
            } else {
                Some(state.health.subscribe())
            }
        };

        // Retries hold while the host's fate is unresolved. The borrow is
        // copied out before awaiting so the watch lock is never held across
        // a suspension point.
        if let Some(mut receiver) = waiter {
            loop {
                let health = *receiver.borrow();
                match health {
                    HostHealth::Alive => break,
                    HostHealth::Offline => return Err(Self::offline(&host)),
                    HostHealth::Pending => {
                        if receiver.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn after_headers(&self, entry: &mut Entry) -> RuleResult {
        let host = host_key(&entry.request.url);
        let hosts = self.hosts.read().clone();
        if let Some(mut state) = hosts.get_mut(&host) {
            state.request_count = 0;
            state.timeout_requests = 0;
            state.health.send_replace(HostHealth::Alive);
        }
        Ok(())
    }

    async fn on_timeout(&self, entry: &mut Entry) -> RuleResult {
        let host = host_key(&entry.request.url);
        let hosts = self.hosts.read().clone();
        let mut state = hosts.entry(host.clone()).or_insert_with(HostEntry::new);

        state.timeout_requests += 1;
        if *state.health.borrow() == HostHealth::Offline {
            return Err(Self::offline(&host));
        }
        if state.timeout_requests > self.threshold
            || state.timeout_requests == state.request_count
        {
            tracing::warn!(host = %host, "host declared dead");
            state.health.send_replace(HostHealth::Offline);
            return Err(Self::offline(&host));
        }
        state.health.send_replace(HostHealth::Pending);
        Ok(())
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.hosts.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.hosts.write() = kb.get::<HostMap>(KB_KEY)?;
        Ok(())
    }
}
