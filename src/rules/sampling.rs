//! Response signatures: content hash, simhash and body-prefix samples.
//!
//! The sampling rules annotate each response so later heuristics can compare
//! pages without keeping full bodies around. [`SignatureComparator`] decides
//! whether two responses are "the same page": equal status codes plus any of
//! raw-hash equality, a small simhash distance, or a high sequence ratio
//! between body samples. Substrings that vary with the requested URL are
//! neutralized before sample comparison so a page echoing the path back
//! still matches.

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use md5::{Digest, Md5};
use url::Url;

use crate::error::RuleResult;
use crate::http::Entry;
use crate::ruleset::Heuristic;
use crate::rules::simhash::{DEFAULT_TOKEN_SIZE, Simhash};

/// Bytes of body kept for sample comparison.
pub const DEFAULT_SAMPLE_LENGTH: usize = 5120;

/// Sequence ratio above which two samples count as the same page.
pub const DEFAULT_MATCH_RATIO: f64 = 0.8;

/// Simhash Hamming distance under which two pages count as the same.
pub const DEFAULT_DISTANCE_THRESHOLD: u32 = 5;

/// Replaces URL-derived substrings inside samples before comparison.
const TARGET_MARKER: &[u8] = b"%target%";

/// Condensed identity of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSignature {
    pub code: StatusCode,
    /// Raw MD5 of the body.
    pub content_hash: Option<[u8; 16]>,
    /// Simhash fingerprint; absent for non-text bodies.
    pub content_simhash: Option<u64>,
    /// Normalized body prefix.
    pub content_sample: Option<Bytes>,
}

/// Annotates `entry.result.content_hash` with the body's raw MD5.
#[derive(Default)]
pub struct ContentHashSampling;

#[async_trait]
impl Heuristic for ContentHashSampling {
    async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        if let Some(response) = &entry.response {
            entry.result.content_hash = Some(md5_digest(response.raw()));
        }
        Ok(())
    }
}

/// Annotates `entry.result.content_simhash` for text bodies.
pub struct ContentSimhashSampling {
    token_size: usize,
}

impl ContentSimhashSampling {
    pub fn new(token_size: usize) -> Self {
        Self { token_size }
    }
}

impl Default for ContentSimhashSampling {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_SIZE)
    }
}

#[async_trait]
impl Heuristic for ContentSimhashSampling {
    async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        if let Some(response) = &entry.response {
            // Binary content gets no fingerprint; the hash covers it.
            entry.result.content_simhash = response
                .content()
                .ok()
                .map(|text| Simhash::with_token_size(&text, self.token_size).value());
        }
        Ok(())
    }
}

/// Annotates `entry.result.content_sample` with the body prefix.
pub struct ContentSampleSampling {
    sample_length: usize,
}

impl ContentSampleSampling {
    pub fn new(sample_length: usize) -> Self {
        Self { sample_length }
    }
}

impl Default for ContentSampleSampling {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_LENGTH)
    }
}

#[async_trait]
impl Heuristic for ContentSampleSampling {
    async fn after_response(&self, entry: &mut Entry) -> RuleResult {
        if let Some(response) = &entry.response {
            let raw = response.raw();
            entry.result.content_sample = Some(raw.slice(0..raw.len().min(self.sample_length)));
        }
        Ok(())
    }
}

/// Builds signatures out of entries and decides whether they match.
pub struct SignatureComparator {
    distance_threshold: u32,
    sample_length: usize,
    match_ratio: f64,
}

impl SignatureComparator {
    pub fn new(distance_threshold: u32) -> Self {
        Self {
            distance_threshold,
            sample_length: DEFAULT_SAMPLE_LENGTH,
            match_ratio: DEFAULT_MATCH_RATIO,
        }
    }

    /// Signature of `entry`'s response, reusing whatever the sampling rules
    /// already computed and filling the gaps. Returns `None` when the entry
    /// has no response.
    pub fn from_entry(&self, entry: &Entry) -> Option<ContentSignature> {
        let url = entry.request.url.clone();
        self.signature_for(entry, &url)
    }

    fn signature_for(&self, entry: &Entry, url: &Url) -> Option<ContentSignature> {
        let response = entry.response.as_ref()?;
        let content_hash = entry
            .result
            .content_hash
            .or_else(|| Some(md5_digest(response.raw())));
        let content_simhash = entry.result.content_simhash.or_else(|| {
            response
                .content()
                .ok()
                .map(|text| Simhash::of(&text).value())
        });
        let raw_sample = entry.result.content_sample.clone().unwrap_or_else(|| {
            let raw = response.raw();
            raw.slice(0..raw.len().min(self.sample_length))
        });
        Some(ContentSignature {
            code: response.code,
            content_hash,
            content_simhash,
            content_sample: Some(normalize_sample(&raw_sample, url)),
        })
    }

    /// Whether `entry`'s response matches `candidate`. `url` names the
    /// request whose varying parts must be neutralized in the sample.
    pub fn match_signature(&self, entry: &Entry, candidate: &ContentSignature, url: &Url) -> bool {
        let Some(current) = self.signature_for(entry, url) else {
            return false;
        };
        if current.code != candidate.code {
            return false;
        }
        if let (Some(ours), Some(theirs)) = (current.content_hash, candidate.content_hash) {
            if ours == theirs {
                return true;
            }
        }
        if let (Some(ours), Some(theirs)) = (current.content_simhash, candidate.content_simhash) {
            let distance = Simhash::from_value(ours).distance(&Simhash::from_value(theirs));
            if distance < self.distance_threshold {
                return true;
            }
        }
        if let (Some(ours), Some(theirs)) = (&current.content_sample, &candidate.content_sample) {
            if sequence_ratio(ours, theirs) > self.match_ratio {
                return true;
            }
        }
        false
    }

    /// Whether any signature of `candidates` matches `entry`.
    pub fn match_list(
        &self,
        entry: &Entry,
        candidates: Option<&[ContentSignature]>,
        url: &Url,
    ) -> bool {
        candidates
            .map(|list| {
                list.iter()
                    .any(|candidate| self.match_signature(entry, candidate, url))
            })
            .unwrap_or(false)
    }
}

impl Default for SignatureComparator {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCE_THRESHOLD)
    }
}

pub(crate) fn md5_digest(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Replaces the full URL and its path inside `sample` with a fixed marker.
fn normalize_sample(sample: &Bytes, url: &Url) -> Bytes {
    let mut out = replace_bytes(sample, url.as_str().as_bytes(), TARGET_MARKER);
    let path = url.path();
    if path.len() > 1 {
        out = replace_bytes(&out, path.as_bytes(), TARGET_MARKER);
    }
    Bytes::from(out)
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut index = 0;
    while index < haystack.len() {
        if haystack[index..].starts_with(needle) {
            out.extend_from_slice(replacement);
            index += needle.len();
        } else {
            out.push(haystack[index]);
            index += 1;
        }
    }
    out
}

/// Ratcliff-Obershelp similarity over byte sequences.
pub(crate) fn sequence_ratio(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = matching_bytes(a, b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

fn matching_bytes(a: &[u8], b: &[u8]) -> usize {
    let mut total = 0;
    let mut stack = vec![(0usize, a.len(), 0usize, b.len())];
    while let Some((alo, ahi, blo, bhi)) = stack.pop() {
        if alo >= ahi || blo >= bhi {
            continue;
        }
        let (i, j, size) = longest_match(&a[alo..ahi], &b[blo..bhi]);
        if size == 0 {
            continue;
        }
        total += size;
        stack.push((alo, alo + i, blo, blo + j));
        stack.push((alo + i + size, ahi, blo + j + size, bhi));
    }
    total
}

fn longest_match(a: &[u8], b: &[u8]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous_row = vec![0usize; b.len() + 1];
    let mut current_row = vec![0usize; b.len() + 1];
    for (i, byte_a) in a.iter().enumerate() {
        for (j, byte_b) in b.iter().enumerate() {
            if byte_a == byte_b {
                let run = previous_row[j] + 1;
                current_row[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            } else {
                current_row[j + 1] = 0;
            }
        }
        std::mem::swap(&mut previous_row, &mut current_row);
    }
    best
}
