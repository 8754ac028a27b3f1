//! Ordered fallback chain of retrieval strategies.
//!
//! Every strategy implements [`FetchStrategy`]. The [`StrategyChain`] tries them in
//! priority order, retrying each one with exponential backoff on transient failures
//! before escalating to the next (heavier) strategy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, COOKIE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

const CHALLENGE_MARKERS: [&str; 2] = ["Cloudflare", "Checking your browser"];

const BROWSER_HEADERS: [(&str, &str); 4] = [
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    ),
    ("accept-language", "en-US,en;q=0.5"),
    ("connection", "keep-alive"),
    ("upgrade-insecure-requests", "1"),
];

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    Blocked,
    Timeout,
    Parse,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("network error fetching {url}: {reason}")]
    Network {
        url: String,
        reason: String,
        retryable: bool,
    },
    #[error("blocked by source fetching {url} (status {status:?}): {reason}")]
    Blocked {
        url: String,
        status: Option<u16>,
        reason: String,
        retryable: bool,
    },
    #[error("timed out after {elapsed:?} fetching {url}")]
    Timeout { url: String, elapsed: Duration },
    #[error("unreadable response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Network { .. } => FetchErrorKind::Network,
            Self::Blocked { .. } => FetchErrorKind::Blocked,
            Self::Timeout { .. } => FetchErrorKind::Timeout,
            Self::Parse { .. } => FetchErrorKind::Parse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } | Self::Blocked { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Parse { .. } => false,
        }
    }

    pub fn timeout(url: &str, elapsed: Duration) -> Self {
        Self::Timeout {
            url: url.to_string(),
            elapsed,
        }
    }

    fn from_status(url: &str, status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 | 451 => Self::Blocked {
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: "access denied".to_string(),
                retryable: false,
            },
            429 => Self::Blocked {
                url: url.to_string(),
                status: Some(429),
                reason: "rate limited".to_string(),
                retryable: true,
            },
            _ => Self::Network {
                url: url.to_string(),
                reason: format!("http status {status}"),
                retryable: classify_status(status) == RetryDisposition::Retryable,
            },
        }
    }

    fn from_reqwest(url: &str, err: &reqwest::Error, elapsed: Duration) -> Self {
        if err.is_timeout() {
            return Self::timeout(url, elapsed);
        }
        if err.is_decode() || err.is_body() {
            return Self::Parse {
                url: url.to_string(),
                reason: err.to_string(),
            };
        }
        Self::Network {
            url: url.to_string(),
            reason: err.to_string(),
            retryable: err.is_connect() || err.is_request(),
        }
    }
}

/// Per-request inputs shared by every strategy in a chain.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub requires_browser_profile: bool,
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            timeout: Duration::from_secs(15),
            requires_browser_profile: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub strategy: String,
}

/// Outcome of running the whole chain for one target.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub outcome: Result<FetchedPage, FetchError>,
    pub attempts: usize,
    pub elapsed: Duration,
}

impl FetchResult {
    pub fn failed(url: impl Into<String>, error: FetchError, elapsed: Duration) -> Self {
        Self {
            url: url.into(),
            outcome: Err(error),
            attempts: 0,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn page(&self) -> Option<&FetchedPage> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.outcome.as_ref().err()
    }

    pub fn strategy(&self) -> Option<&str> {
        self.page().map(|page| page.strategy.as_str())
    }
}

/// One retrieval mechanism. Implementations must not mutate shared state.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn provides_browser_profile(&self) -> bool {
        false
    }

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, FetchError>;
}

pub fn looks_like_challenge(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

fn header_map(pairs: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let header = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {name}"))?;
        // The client negotiates its own encodings and only decodes gzip and brotli.
        if header == ACCEPT_ENCODING {
            continue;
        }
        let value = HeaderValue::from_str(&value)
            .with_context(|| format!("invalid value for header {name}"))?;
        map.insert(header, value);
    }
    Ok(map)
}

fn browser_header_pairs() -> Vec<(String, String)> {
    BROWSER_HEADERS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn send_and_classify(
    client: &reqwest::Client,
    strategy: &str,
    headers: &HeaderMap,
    url: &str,
    ctx: &FetchContext,
) -> Result<FetchedPage, FetchError> {
    let started = Instant::now();
    let mut request = client.get(url).timeout(ctx.timeout).headers(headers.clone());
    for (name, value) in &ctx.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let resp = request
        .send()
        .await
        .map_err(|err| FetchError::from_reqwest(url, &err, started.elapsed()))?;
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::from_status(url, status));
    }

    let body = resp
        .text()
        .await
        .map_err(|err| FetchError::from_reqwest(url, &err, started.elapsed()))?;
    if looks_like_challenge(&body) {
        return Err(FetchError::Blocked {
            url: url.to_string(),
            status: Some(status.as_u16()),
            reason: "anti-bot challenge page".to_string(),
            retryable: false,
        });
    }

    Ok(FetchedPage {
        url: url.to_string(),
        final_url,
        status: status.as_u16(),
        body,
        strategy: strategy.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub browser_profile: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            browser_profile: None,
        }
    }
}

/// Plain `reqwest` retrieval with a fixed header set.
#[derive(Debug)]
pub struct HttpStrategy {
    name: String,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpStrategy {
    fn build(
        name: &str,
        config: &HttpClientConfig,
        user_agent: Option<&str>,
        headers: HeaderMap,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            name: name.to_string(),
            client,
            headers,
        })
    }

    /// Cheapest strategy: the configured user agent and no extra headers.
    pub fn plain(config: &HttpClientConfig) -> anyhow::Result<Self> {
        Self::build("http", config, config.user_agent.as_deref(), HeaderMap::new())
    }

    /// Desktop-browser user agent and navigation headers.
    pub fn browser_like(config: &HttpClientConfig) -> anyhow::Result<Self> {
        Self::build(
            "browser-headers",
            config,
            Some(BROWSER_USER_AGENT),
            header_map(browser_header_pairs())?,
        )
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, FetchError> {
        send_and_classify(&self.client, &self.name, &self.headers, url, ctx).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCookie {
    pub name: String,
    pub value: String,
}

/// Identity captured from a real browser session, stored as `profile.json` in the
/// user-profile directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: Vec<ProfileCookie>,
}

impl BrowserProfile {
    pub const FILE_NAME: &'static str = "profile.json";

    pub fn load(profile_dir: &Path) -> anyhow::Result<Self> {
        let path = profile_dir.join(Self::FILE_NAME);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Heaviest strategy: replays a captured browser profile (user agent, headers, cookies).
#[derive(Debug)]
pub struct ProfileStrategy {
    inner: HttpStrategy,
}

impl ProfileStrategy {
    pub fn new(config: &HttpClientConfig, profile: &BrowserProfile) -> anyhow::Result<Self> {
        let mut pairs = browser_header_pairs();
        pairs.extend(profile.headers.clone());
        let mut headers = header_map(pairs)?;
        if let Some(cookie) = profile.cookie_header() {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(&cookie).context("invalid profile cookie header")?,
            );
        }
        let inner = HttpStrategy::build(
            "browser-profile",
            config,
            Some(profile.user_agent.as_str()),
            headers,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl FetchStrategy for ProfileStrategy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn provides_browser_profile(&self) -> bool {
        true
    }

    async fn fetch(&self, url: &str, ctx: &FetchContext) -> Result<FetchedPage, FetchError> {
        self.inner.fetch(url, ctx).await
    }
}

/// Strategies in priority order, cheapest first.
#[derive(Clone)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    backoff: BackoffPolicy,
}

impl StrategyChain {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            strategies: Vec::new(),
            backoff,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// `http` → `browser-headers` → `browser-profile` (only when a profile directory is configured).
    pub fn from_config(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut chain = Self::new(config.backoff)
            .with_strategy(Arc::new(HttpStrategy::plain(config)?))
            .with_strategy(Arc::new(HttpStrategy::browser_like(config)?));
        if let Some(dir) = &config.browser_profile {
            let profile = BrowserProfile::load(dir)?;
            chain = chain.with_strategy(Arc::new(ProfileStrategy::new(config, &profile)?));
        }
        Ok(chain)
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain for one URL. Always yields a [`FetchResult`], success or classified failure.
    pub async fn fetch(&self, url: &str, ctx: &FetchContext) -> FetchResult {
        let started = Instant::now();
        let mut attempts = 0usize;
        let outcome = self
            .run_strategies(url, ctx, &mut attempts)
            .instrument(info_span!("http_fetch", url))
            .await;

        let outcome = outcome.map_err(|last_error| {
            let error = last_error.unwrap_or_else(|| FetchError::Network {
                url: url.to_string(),
                reason: "no eligible fetch strategy".to_string(),
                retryable: false,
            });
            warn!(url, kind = ?error.kind(), error = %error, "all fetch strategies failed");
            error
        });

        FetchResult {
            url: url.to_string(),
            outcome,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    async fn run_strategies(
        &self,
        url: &str,
        ctx: &FetchContext,
        attempts: &mut usize,
    ) -> Result<FetchedPage, Option<FetchError>> {
        let mut last_error = None;
        let eligible = self
            .strategies
            .iter()
            .filter(|s| !ctx.requires_browser_profile || s.provides_browser_profile());

        for strategy in eligible {
            for attempt in 0..=self.backoff.max_retries {
                *attempts += 1;
                let err = match strategy.fetch(url, ctx).await {
                    Ok(page) => return Ok(page),
                    Err(err) => err,
                };
                let retry = err.is_retryable() && attempt < self.backoff.max_retries;
                debug!(
                    strategy = strategy.name(),
                    attempt,
                    kind = ?err.kind(),
                    retry,
                    error = %err,
                    "fetch attempt failed"
                );
                last_error = Some(err);
                if !retry {
                    break;
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }
        Err(last_error)
    }
}
