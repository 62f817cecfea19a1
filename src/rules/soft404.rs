//! Soft-404 and catch-all page detection.
//!
//! Some servers answer 200 with the same "not found" page for any URL under
//! a directory. To tell those apart from real hits, every successful
//! non-404 response is compared against samples fetched for random URLs
//! shaped like the requested one. URLs are generalized into patterns
//! (`/admin/save.php` becomes `/admin/\l.php`) so probes are shared across
//! similarly-shaped requests, and sample collection for a given pattern runs
//! at most once per origin, with concurrent requests awaiting the same
//! probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use http::StatusCode;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use url::Url;

use crate::engine::retry::RetryEngine;
use crate::error::{HammerTimeError, KnowledgeBaseError, RuleResult};
use crate::http::{Arguments, Entry, Request};
use crate::kb::KnowledgeBase;
use crate::ruleset::{Heuristic, Heuristics};
use crate::rules::sampling::{ContentSignature, SignatureComparator};

const KB_KEY: &str = "soft_404_responses";

/// Timeout granted to sample probes; far above the usual dynamic timeout
/// since a missing sample invalidates every result under the pattern.
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per sample URL before giving up on it.
const SAMPLE_ATTEMPTS: usize = 5;

type SampleList = Arc<[ContentSignature]>;

/// Collected samples per `(origin, pattern)`. `None` records a collection
/// that failed, which is different from a pattern never probed.
type SampleCache = DashMap<(String, String), Option<SampleList>>;

/// Generalizes URL paths into patterns and instantiates random URLs shaped
/// like them.
///
/// The terminal path component is rewritten into character-class tokens:
/// `\l` lowercase letters, `\L` uppercase letters, `\i` mixed-case letters,
/// `\d` digits, `\w` word characters. Everything else stands for itself.
/// Leading directories stay literal; for a directory URL only the last
/// segment is generalized, and for a filename the extension is preserved.
#[derive(Default)]
pub struct SimilarPathGenerator;

/// Characters allowed in a prefix considered for tail patterns.
pub(crate) const TAIL_CHARS: &str = "abcdefghijklmnopqrstuvwxyz-";

static TAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/([a-z-]+)((\.[a-z0-9.]*[a-z0-9])|/)$").expect("tail pattern regex is valid")
});

impl SimilarPathGenerator {
    /// Pattern of `url`'s path with the terminal component generalized.
    pub fn pattern_for_url(&self, url: &Url) -> String {
        let path = url.path();
        let (directories, filename) = split_path(path);
        if !filename.is_empty() {
            let mut prefix = directories.to_string();
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix + &self.pattern_for_filename(filename)
        } else {
            self.pattern_for_directory(directories)
        }
    }

    fn pattern_for_directory(&self, directory_path: &str) -> String {
        if directory_path == "/" {
            return "/".to_string();
        }
        let trimmed = directory_path.trim_matches('/');
        match trimmed.rfind('/') {
            Some(pos) => format!(
                "/{}/{}/",
                &trimmed[..pos],
                pattern_from_string(&trimmed[pos + 1..])
            ),
            None => format!("/{}/", pattern_from_string(trimmed)),
        }
    }

    fn pattern_for_filename(&self, filename: &str) -> String {
        let (stem, extension) = split_extension(filename);
        pattern_from_string(stem) + extension
    }

    /// Rewrites a trailing `/word`, `/word.ext` or `/word/` into `/word`
    /// followed by `tail`, as an absolute URL string. Catches prefix-based
    /// catch-alls where `/login`, `/loginfoo` and `/login.tar.gz` all serve
    /// the same page.
    pub fn tail_pattern(&self, url: &Url, tail: &str) -> Option<String> {
        let path = url.path();
        if !TAIL_RE.is_match(path) {
            return None;
        }
        let replaced = TAIL_RE.replace(path, |caps: &regex::Captures| {
            format!("/{}{}", &caps[1], tail)
        });
        if replaced == path {
            return None;
        }
        let origin = origin_of(url);
        Some(format!("{}{}", origin.trim_end_matches('/'), replaced))
    }

    /// Instantiates a random URL matching `pattern`. The pattern is either a
    /// path or an absolute URL string; class tokens are substituted before
    /// parsing, so no token ever reaches the URL parser.
    pub fn generate_url(&self, base: &Url, pattern: &str) -> Option<Url> {
        let mut rendered = pattern.to_string();
        let mut rng = rand::rng();
        for class in ["\\l", "\\L", "\\i", "\\d", "\\w"] {
            if rendered.contains(class) {
                let length = rng.random_range(8..=15);
                let replacement = random_token(class, length, &mut rng);
                rendered = rendered.replace(class, &replacement);
            }
        }
        base.join(&rendered).ok()
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

fn pattern_from_string(text: &str) -> String {
    let mut out = String::new();
    let mut token = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            token.push(c);
        } else {
            if !token.is_empty() {
                out.push_str(classify_token(&token));
                token.clear();
            }
            out.push(c);
        }
    }
    if !token.is_empty() {
        out.push_str(classify_token(&token));
    }
    out
}

fn classify_token(token: &str) -> &'static str {
    if token.chars().all(|c| c.is_ascii_lowercase()) {
        "\\l"
    } else if token.chars().all(|c| c.is_ascii_uppercase()) {
        "\\L"
    } else if token.chars().all(|c| c.is_ascii_alphabetic()) {
        "\\i"
    } else if token.chars().all(|c| c.is_ascii_digit()) {
        "\\d"
    } else {
        "\\w"
    }
}

fn random_token(class: &str, length: usize, rng: &mut impl Rng) -> String {
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"0123456789";
    const WORD: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

    // Seed characters pin the token to its class so re-extracting the
    // pattern of a generated URL yields the original pattern.
    let (alphabet, seed): (&[u8], &str) = match class {
        "\\l" => (LOWER, ""),
        "\\L" => (UPPER, ""),
        "\\i" => (LETTERS, "aA"),
        "\\d" => (DIGITS, ""),
        "\\w" => (WORD, "a1_"),
        _ => return String::new(),
    };
    let mut out = String::from(seed);
    while out.len() < length {
        out.push(alphabet[rng.random_range(0..alphabet.len())] as char);
    }
    out
}

fn origin_of(url: &Url) -> String {
    url.join("/").map(|u| u.to_string()).unwrap_or_else(|_| url.to_string())
}

/// Detects pages that answer the same content for effectively any URL of a
/// given shape under a directory.
///
/// Runs on every successful non-404 response: parent paths and prefix tails
/// with cached samples are checked first, then samples for the URL's own
/// pattern are fetched through the priority lane (serialized per pattern)
/// and compared against the response. The verdict lands in
/// `entry.result.soft404`; [`RejectSoft404`] turns a positive into a
/// rejection.
pub struct DetectSoft404 {
    engine: OnceCell<Arc<RetryEngine>>,
    child_heuristics: RwLock<Option<Arc<Heuristics>>>,
    comparator: SignatureComparator,
    generator: SimilarPathGenerator,
    confirmation_factor: usize,
    collect_retry_delay: Duration,
    tail_lookup: bool,
    responses: RwLock<Arc<SampleCache>>,
    collecting: DashMap<(String, String), Arc<tokio::sync::OnceCell<Option<SampleList>>>>,
}

impl DetectSoft404 {
    pub fn new() -> Self {
        Self {
            engine: OnceCell::new(),
            child_heuristics: RwLock::new(None),
            comparator: SignatureComparator::default(),
            generator: SimilarPathGenerator,
            confirmation_factor: 1,
            collect_retry_delay: Duration::from_secs(5),
            tail_lookup: true,
            responses: RwLock::new(Arc::new(SampleCache::default())),
            collecting: DashMap::new(),
        }
    }

    /// Hamming distance under which sample and response count as the same.
    pub fn with_distance_threshold(mut self, distance_threshold: u32) -> Self {
        self.comparator = SignatureComparator::new(distance_threshold);
        self
    }

    /// Number of random sample URLs fetched per pattern.
    pub fn with_confirmation_factor(mut self, confirmation_factor: usize) -> Self {
        self.confirmation_factor = confirmation_factor.max(1);
        self
    }

    /// Backoff between attempts of a failing sample fetch.
    pub fn with_collect_retry_delay(mut self, delay: Duration) -> Self {
        self.collect_retry_delay = delay;
        self
    }

    /// Disables the prefix tail probes.
    pub fn without_tail_lookup(mut self) -> Self {
        self.tail_lookup = false;
        self
    }

    fn is_home(&self, url: &Url) -> bool {
        url.as_str() == origin_of(url)
    }

    async fn is_soft_404(&self, url: &Url, entry: &Entry) -> Result<bool, HammerTimeError> {
        if self.is_home(url) {
            return Ok(false);
        }

        // Known parent paths and extensions first: when a catch-all is
        // already on file, no extra request is spent on this URL.
        for candidate in self.enumerate_candidates(url) {
            let pattern = self.generator.pattern_for_url(&candidate);
            let cached = self.get_sample(&candidate, Some(pattern), false).await;
            if self.comparator.match_list(entry, cached.as_deref(), url) {
                return Ok(true);
            }
        }

        if self.tail_matches(entry).await {
            return Ok(true);
        }

        // Fully perform, fetching as required.
        let own_pattern = self.generator.pattern_for_url(url);
        let sample = self.get_sample(url, Some(own_pattern), true).await;
        let tail_a = if self.tail_lookup {
            let pattern = self.generator.tail_pattern(url, "\\l");
            self.get_sample(url, pattern, true).await
        } else {
            None
        };
        let tail_b = if self.tail_lookup {
            let pattern = self.generator.tail_pattern(url, ".\\l");
            self.get_sample(url, pattern, true).await
        } else {
            None
        };

        if self.comparator.match_list(entry, sample.as_deref(), url) {
            return Ok(true);
        }
        if self.comparator.match_list(entry, tail_a.as_deref(), url) {
            return Ok(true);
        }
        if self.comparator.match_list(entry, tail_b.as_deref(), url) {
            return Ok(true);
        }

        if sample.is_none() {
            return Err(HammerTimeError::reject(
                "Impossible to obtain required sample. Cannot confirm result validity.",
            ));
        }
        Ok(false)
    }

    /// Parent paths of `url`, each in both file and directory form.
    fn enumerate_candidates(&self, url: &Url) -> Vec<Url> {
        let mut out = Vec::new();
        let mut path = url.path().to_string();
        while path.len() > 1 {
            if let Ok(candidate) = url.join(&path) {
                out.push(candidate);
            }
            if !path.ends_with('/') {
                if let Ok(candidate) = url.join(&format!("{path}/")) {
                    out.push(candidate);
                }
            }
            let next = if path.ends_with('/') {
                path.trim_end_matches('/').to_string()
            } else {
                match path.rfind('/') {
                    Some(0) => "/".to_string(),
                    Some(pos) => path[..pos].to_string(),
                    None => break,
                }
            };
            if next == path {
                break;
            }
            path = next;
        }
        out
    }

    /// Checks cached tail patterns along every valid prefix of the last URL
    /// component. Catches `/loginfoo` and `/login.tar.gz` when `/login` has
    /// a catch-all on file.
    async fn tail_matches(&self, entry: &Entry) -> bool {
        let url = &entry.request.url;
        let url_str = url.as_str();
        let Some(tail_start) = url_str.rfind('/') else {
            return false;
        };

        for end in (tail_start + 2)..url_str.len() {
            let prefix = &url_str[..end];
            let last = prefix.as_bytes()[end - 1] as char;
            if !TAIL_CHARS.contains(last) {
                break;
            }
            for tail in ["\\l", ".\\l"] {
                let pattern = format!("{prefix}{tail}");
                let cached = self.get_sample(url, Some(pattern), false).await;
                if self.comparator.match_list(entry, cached.as_deref(), url) {
                    return true;
                }
            }
        }
        false
    }

    /// Samples for `(origin of url, pattern)`. With `fetch_missing`, a cache
    /// miss triggers collection, serialized per pattern so concurrent
    /// callers await the same probe.
    async fn get_sample(
        &self,
        url: &Url,
        pattern: Option<String>,
        fetch_missing: bool,
    ) -> Option<SampleList> {
        let pattern = pattern?;
        if self.is_home(url) {
            return None;
        }
        let key = (origin_of(url), pattern);
        let cache = self.responses.read().clone();
        if let Some(cached) = cache.get(&key) {
            return cached.clone();
        }
        if !fetch_missing {
            return None;
        }

        let cell = self.collecting.entry(key.clone()).or_default().clone();
        cell.get_or_init(|| async {
            let samples = self.collect_samples(url, &key.1).await;
            cache.insert(key.clone(), samples.clone());
            samples
        })
        .await
        .clone()
    }

    /// Sample collection is very tolerant to failures since a missing
    /// sample invalidates every result under the pattern: several attempts
    /// per URL, long backoff, extended timeout.
    async fn collect_samples(&self, url: &Url, pattern: &str) -> Option<SampleList> {
        let urls: Vec<Url> = (0..self.confirmation_factor)
            .filter_map(|_| self.generator.generate_url(url, pattern))
            .collect();

        let fetches = urls.into_iter().map(|sample_url| self.fetch_sample(sample_url));
        let samples: Vec<ContentSignature> = futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect();

        if samples.is_empty() {
            tracing::debug!(pattern, "no sample could be obtained");
            None
        } else {
            Some(Arc::from(samples))
        }
    }

    async fn fetch_sample(&self, url: Url) -> Option<ContentSignature> {
        let engine = self.engine.get()?;
        let child = self.child_heuristics.read().clone();

        for _ in 0..SAMPLE_ATTEMPTS {
            let mut probe = Entry::with_arguments(
                Request::new(url.clone()),
                Arguments::with_timeout(SAMPLE_TIMEOUT),
            );
            match engine.perform_high_priority(&mut probe, child.as_ref()).await {
                Ok(()) => return self.comparator.from_entry(&probe),
                Err(HammerTimeError::Stop(_)) => {
                    tokio::time::sleep(self.collect_retry_delay).await;
                }
                Err(_) => return None,
            }
        }
        None
    }
}

impl Default for DetectSoft404 {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Heuristic for DetectSoft404 {
    async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        entry.result.soft404 = Some(false);
        let code = entry.response.as_ref().map(|response| response.code);
        // A real 404 tells us the server does distinguish missing paths.
        if let Some(code) = code {
            if code != StatusCode::NOT_FOUND {
                let url = entry.request.url.clone();
                let verdict = self.is_soft_404(&url, entry).await?;
                entry.result.soft404 = Some(verdict);
            }
        }
        Ok(())
    }

    fn set_engine(&self, engine: Arc<RetryEngine>) {
        let _ = self.engine.set(engine);
    }

    fn set_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        kb.set(KB_KEY, self.responses.read().clone())
    }

    fn load_kb(&self, kb: &KnowledgeBase) -> Result<(), KnowledgeBaseError> {
        *self.responses.write() = kb.get::<SampleCache>(KB_KEY)?;
        Ok(())
    }

    fn set_child_heuristics(&self, child: Arc<Heuristics>) {
        *self.child_heuristics.write() = Some(child);
    }
}

/// Turns a positive soft-404 verdict into a rejection.
#[derive(Default)]
pub struct RejectSoft404;

#[async_trait]
impl Heuristic for RejectSoft404 {
    async fn on_request_successful(&self, entry: &mut Entry) -> RuleResult {
        if entry.result.soft404 == Some(true) {
            return Err(HammerTimeError::reject(format!(
                "Response to {} is a soft 404",
                entry.request.url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stats;
    use crate::engine::scaling::StaticPolicy;
    use crate::testing::{FakeEngine, FakeStep, entry_with_response, url};

    fn generator() -> SimilarPathGenerator {
        SimilarPathGenerator
    }

    #[test]
    fn pattern_extraction_generalizes_the_terminal_component() {
        let cases = [
            ("/test", "/\\l"),
            ("/test/", "/\\l/"),
            ("/test.html", "/\\l.html"),
            ("/test.png", "/\\l.png"),
            ("/TEST/", "/\\L/"),
            ("/teST", "/\\i"),
            ("/123/test.png", "/123/\\l.png"),
            ("/test/test2/test.123.js", "/test/test2/\\l.\\d.js"),
            ("/test/.test", "/test/.\\l"),
            ("/.test", "/.\\l"),
            ("/", "/"),
            ("/.test/123.php", "/.test/\\d.php"),
            ("/abc/TEST/", "/abc/\\L/"),
            ("/test-123.html", "/\\l-\\d.html"),
            ("/123_test.html", "/\\w.html"),
            ("/te12.st34.html", "/\\w.\\w.html"),
        ];
        for (path, expected) in cases {
            let full = url(&format!("http://example.com{path}"));
            assert_eq!(generator().pattern_for_url(&full), expected, "path {path}");
        }
    }

    #[test]
    fn only_the_last_extension_is_preserved() {
        let full = url("http://example.com/archive.tar.gz");
        assert_eq!(generator().pattern_for_url(&full), "/\\l.\\l.gz");
    }

    #[test]
    fn generated_urls_round_trip_to_the_same_pattern() {
        let paths = [
            "/test",
            "/test/",
            "/test-123",
            "/123-TEST",
            "/te12st34",
            "/teST.html",
            "/test-123.html",
            "/123_test.html",
            "/.test",
            "/.123-test",
            "/dir/file.json",
            "/123/test.json",
        ];
        let generator = generator();
        for path in paths {
            let original = url(&format!("http://example.com{path}"));
            let pattern = generator.pattern_for_url(&original);
            let random = generator.generate_url(&original, &pattern).unwrap();
            assert_eq!(
                generator.pattern_for_url(&random),
                pattern,
                "path {path} random {random}"
            );
        }
    }

    #[test]
    fn generated_urls_share_the_origin() {
        let original = url("http://example.com/dir/file.html");
        let pattern = generator().pattern_for_url(&original);
        let random = generator().generate_url(&original, &pattern).unwrap();
        assert_eq!(random.host_str(), Some("example.com"));
        assert!(random.path().starts_with("/dir/"));
        assert!(random.path().ends_with(".html"));
    }

    #[test]
    fn tail_pattern_rewrites_the_trailing_component() {
        let generator = generator();
        let cases = [
            ("http://example.com/login/", "http://example.com/login\\l"),
            ("http://example.com/login.tar.gz", "http://example.com/login\\l"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                generator.tail_pattern(&url(input), "\\l").as_deref(),
                Some(expected),
                "input {input}"
            );
        }
        assert_eq!(generator.tail_pattern(&url("http://example.com/123"), "\\l"), None);
    }

    fn rule_with_engine(transport: Arc<FakeEngine>) -> (DetectSoft404, Arc<Heuristics>) {
        let stats = Arc::new(Stats::new());
        let engine = Arc::new(RetryEngine::new(
            transport,
            Arc::new(StaticPolicy::new(10)),
            stats,
            0,
            Duration::from_millis(1),
        ));
        let kb = Arc::new(crate::kb::KnowledgeBase::new());
        let heuristics = Arc::new(Heuristics::new(kb, Some(engine)));
        let rule = DetectSoft404::new();
        (rule, heuristics)
    }

    #[tokio::test]
    async fn catch_all_directory_marks_requests_as_soft404() {
        // The server answers the same page for any path.
        let transport = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::ok("<html>nothing to see here, generic page</html>")
        }));
        let (rule, heuristics) = rule_with_engine(transport.clone());
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response(
            "http://example.com/junk",
            200,
            "<html>nothing to see here, generic page</html>",
        );
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(entry.result.soft404, Some(true));

        // The probe went through the engine once.
        assert_eq!(transport.perform_count(), 1);

        // Another URL under the same pattern reuses the cached sample.
        let mut second = entry_with_response(
            "http://example.com/other",
            200,
            "<html>nothing to see here, generic page</html>",
        );
        rule.on_request_successful(&mut second).await.unwrap();
        assert_eq!(second.result.soft404, Some(true));
        assert_eq!(transport.perform_count(), 1);
    }

    #[tokio::test]
    async fn distinct_content_is_not_marked() {
        let transport = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::ok(
                "<html><body><h1>Whoops, nothing here</h1><p>The page could not be \
                 located anywhere on this server, sorry about that.</p></body></html>",
            )
        }));
        let (rule, heuristics) = rule_with_engine(transport);
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response(
            "http://example.com/real",
            200,
            "<html><table><tr><td>alpha</td><td>4217</td></tr><tr><td>beta</td>\
             <td>7781</td></tr><tr><td>gamma</td><td>1204</td></tr></table></html>",
        );
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(entry.result.soft404, Some(false));
    }

    #[tokio::test]
    async fn real_404_skips_detection_entirely() {
        let transport = Arc::new(FakeEngine::ok());
        let (rule, heuristics) = rule_with_engine(transport.clone());
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response("http://example.com/gone", 404, "not found");
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(entry.result.soft404, Some(false));
        assert_eq!(transport.perform_count(), 0);
    }

    #[tokio::test]
    async fn homepage_never_counts_as_soft404() {
        let transport = Arc::new(FakeEngine::ok());
        let (rule, heuristics) = rule_with_engine(transport.clone());
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response("http://example.com/", 200, "home page");
        rule.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(entry.result.soft404, Some(false));
        assert_eq!(transport.perform_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unobtainable_sample_rejects_the_request() {
        let transport = Arc::new(FakeEngine::with_responder(|_| FakeStep::Timeout));
        let (rule, heuristics) = rule_with_engine(transport);
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response("http://example.com/page", 200, "content");
        let result = rule.on_request_successful(&mut entry).await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_sample_collection() {
        let transport = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::ok("<html>same page everywhere on this server</html>")
        }));
        let (rule, heuristics) = rule_with_engine(transport.clone());
        let rule = Arc::new(rule);
        let as_dyn: Arc<dyn Heuristic> = rule.clone();
        heuristics.add(as_dyn).unwrap();

        // Both URLs share the pattern /\l; collection must run only once.
        let mut first = entry_with_response(
            "http://example.com/aaaa",
            200,
            "<html>same page everywhere on this server</html>",
        );
        let mut second = entry_with_response(
            "http://example.com/bbbb",
            200,
            "<html>same page everywhere on this server</html>",
        );
        let (a, b) = tokio::join!(
            rule.on_request_successful(&mut first),
            rule.on_request_successful(&mut second),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(transport.perform_count(), 1);
        assert_eq!(first.result.soft404, Some(true));
        assert_eq!(second.result.soft404, Some(true));
    }

    #[tokio::test]
    async fn failed_collection_is_cached_as_failed() {
        let transport = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::Reject("blocked".into())
        }));
        let (rule, heuristics) = rule_with_engine(transport.clone());
        let rule: Arc<dyn Heuristic> = Arc::new(rule);
        heuristics.add(rule.clone()).unwrap();

        let mut entry = entry_with_response("http://example.com/page", 200, "content");
        let first = rule.on_request_successful(&mut entry).await;
        assert!(first.is_err());
        let probes_after_first = transport.perform_count();

        // The failure is on file; no new probe is spent.
        let mut again = entry_with_response("http://example.com/page", 200, "content");
        let second = rule.on_request_successful(&mut again).await;
        assert!(second.is_err());
        assert_eq!(transport.perform_count(), probes_after_first);
    }

    #[tokio::test]
    async fn reject_soft404_converts_the_verdict() {
        let mut entry = entry_with_response("http://example.com/x", 200, "body");
        entry.result.soft404 = Some(true);
        let result = RejectSoft404.on_request_successful(&mut entry).await;
        assert!(matches!(result, Err(HammerTimeError::Reject(_))));

        entry.result.soft404 = Some(false);
        RejectSoft404.on_request_successful(&mut entry).await.unwrap();
    }

    #[tokio::test]
    async fn shared_kb_lets_two_detectors_share_samples() {
        let transport = Arc::new(FakeEngine::with_responder(|_| {
            FakeStep::ok("<html>same page everywhere on this server</html>")
        }));
        let (first, heuristics) = rule_with_engine(transport.clone());
        let first: Arc<dyn Heuristic> = Arc::new(first);
        heuristics.add(first.clone()).unwrap();

        let mut entry = entry_with_response(
            "http://example.com/abcd",
            200,
            "<html>same page everywhere on this server</html>",
        );
        first.on_request_successful(&mut entry).await.unwrap();
        assert_eq!(transport.perform_count(), 1);

        // A second detector on the same pipeline adopts the bound cache and
        // reuses the collected sample.
        let second: Arc<dyn Heuristic> = Arc::new(DetectSoft404::new());
        heuristics.add(second.clone()).unwrap();
        let mut other = entry_with_response(
            "http://example.com/wxyz",
            200,
            "<html>same page everywhere on this server</html>",
        );
        second.on_request_successful(&mut other).await.unwrap();
        assert_eq!(other.result.soft404, Some(true));
        assert_eq!(transport.perform_count(), 1);
    }
}
