//! A high-volume HTTP request engine.
//!
//! HammerTime drives very large batches of HTTP requests against one or
//! more hosts as fast as they can serve them, while keeping the ability to
//! make contextual decisions on every request: retry, reject, throttle,
//! follow redirects, detect catch-all responses.
//!
//! # High-level features
//! - Bounded request scheduling with cancellable handles
//! - Retry engine with a general lane and a priority lane for internal probes
//! - Adaptive concurrency: slow-start scaling over a resizable semaphore
//! - Extensible heuristic pipeline hooked around each request lifecycle
//! - Soft-404 / catch-all detection through URL-pattern sampling
//! - Dead-host short-circuiting and statistics-driven dynamic timeouts
//!
//! # Architecture
//! The concrete HTTP transport stays outside this crate; anything
//! implementing [`Engine`](engine::Engine) plugs in. Around it,
//! [`engine::retry::RetryEngine`] adds retries and concurrency lanes,
//! [`ruleset::Heuristics`] runs the registered rules at each lifecycle
//! event, and [`HammerTime`] ties submission, bookkeeping and shutdown
//! together.
//!
//! # Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use hammertime::{DetectionStack, HammerTime, Request};
//!
//! # async fn run(transport: Arc<dyn hammertime::Engine>) -> anyhow::Result<()> {
//! let engine = HammerTime::builder()
//!     .engine(transport)
//!     .retry_count(3)
//!     .build()?;
//! DetectionStack::default().install(&engine)?;
//!
//! engine.collect_successful_requests();
//! let _handle = engine.submit(Request::new("http://example.com/".parse()?));
//!
//! let mut results = engine.successful_requests();
//! while let Some(entry) = results.next().await {
//!     if let Some(response) = &entry.response {
//!         println!("{} -> {}", entry.request.url, response.code);
//!     }
//! }
//! engine.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Key concepts
//! - [`http::Entry`] is the unit of work: request, response, per-attempt
//!   result and transport hints.
//! - [`ruleset::Heuristic`] implementations observe and mutate entries;
//!   they coordinate only through the entry and the shared
//!   [`kb::KnowledgeBase`].
//! - [`engine::scaling::SlowStartPolicy`] discovers a host's sustainable
//!   concurrency without a configured target.

/// Engine construction and the standard detection stack.
pub mod config;

/// The facade, counters and the successful-requests stream.
pub mod core;

/// Transport contract, retry engine and concurrency policies.
pub mod engine;

/// Error taxonomy.
pub mod error;

/// Request, response and entry types.
pub mod http;

/// Bind-once knowledge base shared across heuristics.
pub mod kb;

/// Heuristic pipeline and rule sets.
pub mod ruleset;

/// Built-in heuristics.
pub mod rules;

/// Bounded admission of request tasks.
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::{DetectionStack, HammerTimeBuilder};
pub use crate::core::{HammerTime, Stats, SuccessStream};
pub use crate::engine::Engine;
pub use crate::error::{HammerTimeError, KnowledgeBaseError, RuleResult};
pub use crate::http::{Arguments, Entry, Request, RequestResult, Response};
pub use crate::kb::KnowledgeBase;
pub use crate::ruleset::{Heuristic, Heuristics, RuleSet};
pub use crate::scheduler::{RequestHandle, RequestScheduler};
