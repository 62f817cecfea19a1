//! Error taxonomy shared by the engine, the rules and the caller-facing API.
//!
//! Every failure travelling through the pipeline is one of four kinds: a
//! retriable transport failure (`Stop`), a terminal policy rejection
//! (`Reject`), a dead-host short-circuit (`OfflineHost`) or a cooperative
//! `Cancelled`. The retry engine consumes `Stop` until the retry budget is
//! exhausted; everything else propagates to the caller untouched.

use thiserror::Error;

/// Outcome of a single rule hook or engine call.
pub type RuleResult = Result<(), HammerTimeError>;

/// Failure kinds produced by the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HammerTimeError {
    /// Transport-level failure (timeout, reset, transient DNS). Eligible for
    /// retry until the budget runs out.
    #[error("request stopped: {0}")]
    Stop(String),

    /// Policy-level rejection raised by a rule. Never retried.
    #[error("request rejected: {0}")]
    Reject(String),

    /// The target host was declared dead. Never retried.
    #[error("host {0} is offline")]
    OfflineHost(String),

    /// The request was cancelled, either through its handle or because the
    /// facade closed.
    #[error("request cancelled")]
    Cancelled,
}

impl HammerTimeError {
    /// Shorthand for a retriable transport failure.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::Stop(reason.into())
    }

    /// Shorthand for a terminal policy rejection.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }

    /// Whether the retry engine may attempt this request again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Stop(_))
    }
}

/// Failures of the bind-once knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KnowledgeBaseError {
    /// `set` was called for a key that already holds a value.
    #[error("knowledge base key {0} is already bound")]
    AlreadyBound(String),

    /// `get` was called for a key that holds no value.
    #[error("knowledge base key {0} is not bound")]
    Unbound(String),

    /// The stored value does not have the requested type.
    #[error("knowledge base key {0} holds a different type")]
    TypeMismatch(String),
}
