//! Request, response and entry types flowing through the pipeline.
//!
//! An [`Entry`] is the unit of work: the request descriptor, the response
//! once headers arrive, the per-attempt [`RequestResult`] that rules annotate,
//! and the opaque [`Arguments`] used as transport hints. Rules receive a
//! mutable entry at each lifecycle event and communicate exclusively through
//! it and the knowledge base.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

/// Outgoing request descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
}

impl Request {
    /// Creates a GET request for `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }

    /// Creates a request with an explicit method.
    pub fn with_method(url: Url, method: Method) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header, builder style.
    pub fn header(mut self, name: http::header::HeaderName, value: http::header::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Raised by [`Response::content`] when the body cannot be decoded as text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response content is not decodable text")]
pub struct ContentDecodeError;

/// Response headers and body as delivered by the transport.
///
/// The body is kept as raw bytes; [`Response::content`] exposes a decoded
/// text view that prefers utf-8 and falls back to the charset declared in
/// `Content-Type` or by the document itself. A body cut in the middle of a
/// trailing multi-byte sequence still decodes; invalid bytes anywhere else
/// surface a [`ContentDecodeError`].
#[derive(Debug, Clone)]
pub struct Response {
    pub code: StatusCode,
    pub headers: HeaderMap,
    raw: Bytes,
    truncated: bool,
}

impl Response {
    /// Creates a response from the header section; the body is set later
    /// through [`Response::set_content`].
    pub fn new(code: StatusCode, headers: HeaderMap) -> Self {
        Self {
            code,
            headers,
            raw: Bytes::new(),
            truncated: false,
        }
    }

    /// Stores the body. `at_eof` tells whether the read reached the end of
    /// the stream; a partial read marks the response as truncated.
    pub fn set_content(&mut self, data: Bytes, at_eof: bool) {
        self.raw = data;
        self.truncated = !at_eof;
    }

    /// Raw body bytes.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Whether the body was cut before the end of the stream.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Cuts the body down to `limit` bytes and marks the response truncated.
    pub fn truncate(&mut self, limit: usize) {
        if self.raw.len() > limit {
            self.raw = self.raw.slice(0..limit);
            self.truncated = true;
        }
    }

    /// Decoded text view of the body.
    ///
    /// Tries utf-8 first. A decode failure caused only by a cut trailing
    /// multi-byte sequence yields the valid prefix. Otherwise the charset
    /// declared in `Content-Type`, or inside the first kilobyte of the
    /// document, drives an `encoding_rs` decode. Anything else fails.
    pub fn content(&self) -> Result<Cow<'_, str>, ContentDecodeError> {
        match std::str::from_utf8(&self.raw) {
            Ok(text) => Ok(Cow::Borrowed(text)),
            // A truncated read may cut a multi-byte sequence; the valid
            // prefix is the whole content we have.
            Err(err) if self.truncated && err.error_len().is_none() => {
                let valid = &self.raw[..err.valid_up_to()];
                Ok(Cow::Borrowed(
                    std::str::from_utf8(valid).map_err(|_| ContentDecodeError)?,
                ))
            }
            Err(_) => {
                let encoding = self
                    .declared_charset()
                    .and_then(|label| encoding_rs::Encoding::for_label(label.as_bytes()));
                match encoding {
                    Some(encoding) if encoding != encoding_rs::UTF_8 => {
                        let (text, _, _) = encoding.decode(&self.raw);
                        Ok(Cow::Owned(text.into_owned()))
                    }
                    _ => Err(ContentDecodeError),
                }
            }
        }
    }

    /// Lossy text view, replacing undecodable sequences. Used by heuristics
    /// that fingerprint content and tolerate noise.
    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Charset from the `Content-Type` header, else from a `charset=`
    /// declaration within the first kilobyte of the document.
    fn declared_charset(&self) -> Option<String> {
        if let Some(value) = self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            if let Some(label) = charset_label(value) {
                return Some(label);
            }
        }
        let prefix = &self.raw[..self.raw.len().min(1024)];
        let prefix = String::from_utf8_lossy(prefix);
        charset_label(&prefix)
    }
}

fn charset_label(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find("charset=")? + "charset=".len();
    let tail = &lower[start..];
    let label: String = tail
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
        .collect();
    if label.is_empty() { None } else { Some(label) }
}

/// Per-attempt state attached to an entry. Rules populate the optional
/// fields; the retry engine owns `attempt`.
#[derive(Debug, Clone)]
pub struct RequestResult {
    /// 1-based attempt counter, monotonically increasing across retries.
    pub attempt: u32,
    /// Byte cap for the body read. `None` means unlimited.
    pub read_length: Option<usize>,
    /// Redirect chain; the first element is the original entry, cloned at
    /// redirect time.
    pub redirects: Vec<Entry>,
    /// Set by the soft-404 detector.
    pub soft404: Option<bool>,
    /// Set by the behavior-change detector.
    pub error_behavior: Option<bool>,
    /// Raw MD5 of the body, set by the hash sampling rule.
    pub content_hash: Option<[u8; 16]>,
    /// Simhash fingerprint of the body, set by the simhash sampling rule.
    pub content_simhash: Option<u64>,
    /// Body prefix sample, set by the sample sampling rule.
    pub content_sample: Option<Bytes>,
}

impl Default for RequestResult {
    fn default() -> Self {
        Self {
            attempt: 1,
            read_length: None,
            redirects: Vec::new(),
            soft404: None,
            error_behavior: None,
            content_hash: None,
            content_simhash: None,
            content_sample: None,
        }
    }
}

/// Opaque transport hints carried by an entry.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    /// Per-call timeout override, written by the dynamic timeout rule.
    pub timeout: Option<Duration>,
    /// Set by the dynamic timeout rule right before the transport call.
    pub start_time: Option<Instant>,
    /// Free-form correlation keys for the caller.
    pub correlation: HashMap<String, String>,
}

impl Arguments {
    /// Arguments carrying only a timeout override.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// The unit of work: request, response once available, per-attempt result
/// and transport hints.
#[derive(Debug, Clone)]
pub struct Entry {
    pub request: Request,
    pub response: Option<Response>,
    pub result: RequestResult,
    pub arguments: Arguments,
}

impl Entry {
    /// Creates a fresh entry for `request` with default arguments.
    pub fn new(request: Request) -> Self {
        Self::with_arguments(request, Arguments::default())
    }

    /// Creates a fresh entry with explicit arguments.
    pub fn with_arguments(request: Request, arguments: Arguments) -> Self {
        Self {
            request,
            response: None,
            result: RequestResult::default(),
            arguments,
        }
    }
}
