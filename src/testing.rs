//! Test support: a scripted transport and entry builders shared by the
//! module test suites.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use url::Url;

use crate::engine::Engine;
use crate::error::{HammerTimeError, RuleResult};
use crate::http::{Entry, Request, Response};
use crate::ruleset::Heuristics;

/// One scripted transport behavior.
#[derive(Clone)]
pub(crate) enum FakeStep {
    Respond {
        code: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: Bytes,
    },
    Timeout,
    Unreachable,
    Reject(String),
}

impl FakeStep {
    pub(crate) fn ok(body: &str) -> Self {
        Self::Respond {
            code: StatusCode::OK,
            headers: Vec::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub(crate) fn status(code: u16, body: &str) -> Self {
        Self::Respond {
            code: StatusCode::from_u16(code).unwrap(),
            headers: Vec::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub(crate) fn redirect(code: u16, location: &str) -> Self {
        Self::Respond {
            code: StatusCode::from_u16(code).unwrap(),
            headers: vec![("location", location.to_string())],
            body: Bytes::new(),
        }
    }
}

type Responder = Box<dyn Fn(&Url) -> FakeStep + Send + Sync>;

/// Transport double driving the heuristic pipeline the way a real engine
/// would: `before_request`, then either the failure hook plus a `Stop`, or
/// `after_headers` / `after_response` around a canned response.
pub(crate) struct FakeEngine {
    script: Mutex<VecDeque<FakeStep>>,
    responder: Option<Responder>,
    pub(crate) performed: Mutex<Vec<Url>>,
    pub(crate) closed: AtomicBool,
    pub(crate) proxy: Mutex<Option<Url>>,
}

impl FakeEngine {
    /// Responds 200 with a fixed body for every request.
    pub(crate) fn ok() -> Self {
        Self::with_responder(|_| FakeStep::ok("response content"))
    }

    /// Responds 200 with the request URL as the body.
    pub(crate) fn echo_url() -> Self {
        Self::with_responder(|url| FakeStep::ok(url.as_str()))
    }

    /// Pops one scripted step per request; 200 with a fixed body once the
    /// script runs out.
    pub(crate) fn scripted(steps: impl IntoIterator<Item = FakeStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            responder: None,
            performed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            proxy: Mutex::new(None),
        }
    }

    /// Chooses the behavior per request URL.
    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Url) -> FakeStep + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            performed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            proxy: Mutex::new(None),
        }
    }

    pub(crate) fn perform_count(&self) -> usize {
        self.performed.lock().len()
    }

    fn next_step(&self, url: &Url) -> FakeStep {
        if let Some(step) = self.script.lock().pop_front() {
            return step;
        }
        match &self.responder {
            Some(responder) => responder(url),
            None => FakeStep::ok("response content"),
        }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn perform(&self, entry: &mut Entry, heuristics: &Heuristics) -> RuleResult {
        heuristics.before_request(entry).await?;
        self.performed.lock().push(entry.request.url.clone());

        match self.next_step(&entry.request.url) {
            FakeStep::Timeout => {
                heuristics.on_timeout(entry).await?;
                Err(HammerTimeError::stop("Timeout reached"))
            }
            FakeStep::Unreachable => {
                heuristics.on_host_unreachable(entry).await?;
                Err(HammerTimeError::stop("Host unreachable"))
            }
            FakeStep::Reject(reason) => Err(HammerTimeError::reject(reason)),
            FakeStep::Respond { code, headers, body } => {
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.insert(
                        http::header::HeaderName::from_static(name),
                        value.parse().unwrap(),
                    );
                }
                entry.response = Some(Response::new(code, header_map));
                heuristics.after_headers(entry).await?;

                let response = entry.response.as_mut().unwrap();
                match entry.result.read_length {
                    Some(limit) if body.len() > limit => {
                        response.set_content(body.slice(0..limit), false);
                    }
                    _ => response.set_content(body, true),
                }
                heuristics.after_response(entry).await?;
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn set_proxy(&self, proxy: Option<Url>) {
        *self.proxy.lock() = proxy;
    }
}

pub(crate) fn url(raw: &str) -> Url {
    raw.parse().unwrap()
}

pub(crate) fn entry_for(raw: &str) -> Entry {
    Entry::new(Request::new(url(raw)))
}

/// Entry carrying an already-read response, for exercising rules directly.
pub(crate) fn entry_with_response(raw_url: &str, code: u16, body: &str) -> Entry {
    let mut entry = entry_for(raw_url);
    let mut response = Response::new(StatusCode::from_u16(code).unwrap(), HeaderMap::new());
    response.set_content(Bytes::copy_from_slice(body.as_bytes()), true);
    entry.response = Some(response);
    entry
}

pub(crate) fn empty_heuristics() -> Arc<Heuristics> {
    Arc::new(Heuristics::new(
        Arc::new(crate::kb::KnowledgeBase::new()),
        None,
    ))
}
