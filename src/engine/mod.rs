//! Transport boundary and the engines layered on top of it.
//!
//! The concrete HTTP transport lives outside this crate; the pipeline
//! consumes it through the [`Engine`] trait. [`retry::RetryEngine`] wraps a
//! transport with retry accounting and the two concurrency lanes, and
//! [`scaling`] provides the adaptive concurrency policy gating the general
//! lane.

use async_trait::async_trait;
use url::Url;

use crate::error::RuleResult;
use crate::http::Entry;
use crate::ruleset::Heuristics;

pub mod retry;
pub mod scaling;

/// Contract of the underlying HTTP transport.
///
/// Implementations must drive the heuristic pipeline at the documented
/// points of a request:
///
/// 1. `heuristics.before_request(entry)` before any I/O;
/// 2. `heuristics.after_headers(entry)` once the status line and headers
///    are in (`entry.response` populated, body not yet read);
/// 3. `heuristics.after_response(entry)` once the body is read, honoring
///    `entry.result.read_length` as the byte cap.
///
/// Timeouts surface as `Stop("Timeout reached")` after invoking
/// `heuristics.on_timeout(entry)`; unreachable hosts surface the same way
/// after `heuristics.on_host_unreachable(entry)`. If one of those hooks
/// fails, its error takes precedence. `perform` must be reentrancy-safe for
/// concurrent calls up to the semaphore cap and must return promptly when
/// the surrounding task is cancelled.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Performs one attempt of `entry`, mutating it in place.
    async fn perform(&self, entry: &mut Entry, heuristics: &Heuristics) -> RuleResult;

    /// Releases transport resources (connection pools, sockets).
    async fn close(&self) {}

    /// Routes subsequent requests through `proxy`, or directly when `None`.
    fn set_proxy(&self, _proxy: Option<Url>) {}
}
