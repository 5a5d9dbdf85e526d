//! Page fetch contract plus the plain-HTTP and fixture-replay fetchers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SELECTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// One page to acquire for one source crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source_name: String,
    pub url: String,
    pub wait_selector: Option<String>,
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
}

impl FetchRequest {
    pub fn new(source_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            url: url.into(),
            wait_selector: None,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            selector_timeout: DEFAULT_SELECTOR_TIMEOUT,
        }
    }

    pub fn with_wait_selector(mut self, selector: Option<&str>) -> Self {
        self.wait_selector = selector.map(ToString::to_string);
        self
    }

    pub fn with_timeouts(mut self, navigation: Duration, selector: Duration) -> Self {
        self.navigation_timeout = navigation;
        self.selector_timeout = selector;
        self
    }
}

/// DOM snapshot handed to the extractors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPage {
    pub source_name: String,
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
}

impl RenderedPage {
    pub fn new(source_name: impl Into<String>, url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            url: url.into(),
            html: html.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchErrorKind {
    NavigationTimeout,
    NavigationFailed,
    SelectorTimeout,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} for {url}: {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub detail: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            detail: detail.into(),
        }
    }

    pub fn navigation_failed(url: impl Into<String>, detail: impl ToString) -> Self {
        Self::new(FetchErrorKind::NavigationFailed, url, detail.to_string())
    }

    pub fn navigation_timeout(url: impl Into<String>, after: Duration) -> Self {
        Self::new(
            FetchErrorKind::NavigationTimeout,
            url,
            format!("no DOM content after {}s", after.as_secs()),
        )
    }

    pub fn selector_timeout(url: impl Into<String>, selector: &str, after: Duration) -> Self {
        Self::new(
            FetchErrorKind::SelectorTimeout,
            url,
            format!("`{selector}` did not appear within {}s", after.as_secs()),
        )
    }
}

/// Capacity for one in-flight fetch, handed out by [`PageFetcher::reserve`]
/// and released when dropped.
#[derive(Debug)]
pub struct FetchSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl FetchSlot {
    /// A slot from a fetcher with no concurrency cap.
    pub fn unbounded() -> Self {
        Self { _permit: None }
    }

    pub async fn acquire(pool: &Arc<Semaphore>, url: &str) -> Result<Self, FetchError> {
        let permit = pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::navigation_failed(url, "fetcher is shut down"))?;
        Ok(Self {
            _permit: Some(permit),
        })
    }
}

/// Acquires a DOM for a URL in two steps: `reserve` waits for capacity, then
/// `fetch` does the work while holding the slot. Time spent queueing in
/// `reserve` is not part of any fetch timeout.
///
/// Implementations own their resource lifecycle: whatever `fetch` opens is
/// released before it returns, on every path.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn reserve(&self, _request: &FetchRequest) -> Result<FetchSlot, FetchError> {
        Ok(FetchSlot::unbounded())
    }

    async fn fetch(&self, slot: FetchSlot, request: &FetchRequest) -> Result<RenderedPage, FetchError>;
}

/// Checks a static DOM for a wait selector. Fetchers without a script engine
/// use this in place of polling.
pub fn html_has_selector(html: &str, selector: &str) -> Result<bool, String> {
    let sel = Selector::parse(selector).map_err(|e| e.to_string())?;
    let document = Html::parse_document(html);
    let found = document.select(&sel).next().is_some();
    Ok(found)
}

fn require_wait_selector(request: &FetchRequest, html: &str) -> Result<(), FetchError> {
    let Some(selector) = request.wait_selector.as_deref() else {
        return Ok(());
    };
    match html_has_selector(html, selector) {
        Ok(true) => Ok(()),
        Ok(false) => Err(FetchError::selector_timeout(
            &request.url,
            selector,
            request.selector_timeout,
        )),
        Err(reason) => Err(FetchError::new(
            FetchErrorKind::SelectorTimeout,
            &request.url,
            format!("invalid wait selector `{selector}`: {reason}"),
        )),
    }
}

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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Fetches server-rendered pages without a browser. The navigation timeout
/// bounds each attempt; the wait selector is checked once on the static DOM.
#[derive(Debug)]
pub struct HttpPageFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpPageFetcher {
    pub fn new(config: HttpFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    async fn fetch_body(&self, request: &FetchRequest) -> Result<(String, String), FetchError> {
        let url = request.url.as_str();
        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .get(url)
                .timeout(request.navigation_timeout)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .text()
                            .await
                            .map_err(|err| reqwest_to_fetch_error(request, err))?;
                        return Ok((final_url, body));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, url, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::navigation_failed(
                        final_url,
                        format!("http status {}", status.as_u16()),
                    ));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, url, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(reqwest_to_fetch_error(request, err));
                }
            }
        }

        Err(FetchError::navigation_failed(url, "retries exhausted"))
    }
}

fn reqwest_to_fetch_error(request: &FetchRequest, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::navigation_timeout(&request.url, request.navigation_timeout)
    } else {
        FetchError::navigation_failed(&request.url, err)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn reserve(&self, request: &FetchRequest) -> Result<FetchSlot, FetchError> {
        FetchSlot::acquire(&self.in_flight, &request.url).await
    }

    async fn fetch(&self, _slot: FetchSlot, request: &FetchRequest) -> Result<RenderedPage, FetchError> {
        let span = info_span!("http_fetch", source = %request.source_name, url = %request.url);
        let (final_url, html) = self.fetch_body(request).instrument(span).await?;
        require_wait_selector(request, &html)?;

        Ok(RenderedPage {
            source_name: request.source_name.clone(),
            url: final_url,
            html,
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone)]
enum FixtureEntry {
    Page(String),
    Failure(FetchErrorKind),
}

/// Serves canned HTML keyed by source name (case-insensitive). Used for
/// offline replay of captured listings and as the fetcher in tests.
#[derive(Debug, Default)]
pub struct FixturePageFetcher {
    entries: RwLock<HashMap<String, FixtureEntry>>,
    fetches: AtomicUsize,
}

impl FixturePageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `<root>/<source>/sample/listing.html` for every source directory.
    pub fn from_dir(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let fetcher = Self::new();
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("reading fixture root {}", root.display()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let listing = entry.path().join("sample").join("listing.html");
            if !listing.exists() {
                continue;
            }
            let html = std::fs::read_to_string(&listing)
                .with_context(|| format!("reading {}", listing.display()))?;
            let source = entry.file_name().to_string_lossy().to_string();
            fetcher.set_page(&source, html);
        }
        Ok(fetcher)
    }

    pub fn with_page(self, source_name: &str, html: impl Into<String>) -> Self {
        self.set_page(source_name, html);
        self
    }

    pub fn with_failure(self, source_name: &str, kind: FetchErrorKind) -> Self {
        self.set_failure(source_name, kind);
        self
    }

    pub fn set_page(&self, source_name: &str, html: impl Into<String>) {
        self.insert(source_name, FixtureEntry::Page(html.into()));
    }

    pub fn set_failure(&self, source_name: &str, kind: FetchErrorKind) {
        self.insert(source_name, FixtureEntry::Failure(kind));
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn insert(&self, source_name: &str, entry: FixtureEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(source_name.to_ascii_lowercase(), entry);
    }

    fn lookup(&self, source_name: &str) -> Option<FixtureEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&source_name.to_ascii_lowercase()).cloned()
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch(&self, _slot: FetchSlot, request: &FetchRequest) -> Result<RenderedPage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.lookup(&request.source_name) {
            Some(FixtureEntry::Page(html)) => {
                require_wait_selector(request, &html)?;
                Ok(RenderedPage {
                    source_name: request.source_name.clone(),
                    url: request.url.clone(),
                    html,
                    fetched_at: Utc::now(),
                })
            }
            Some(FixtureEntry::Failure(kind)) => Err(FetchError::new(
                kind,
                &request.url,
                "injected fixture failure",
            )),
            None => Err(FetchError::navigation_failed(
                &request.url,
                format!("no fixture page for {}", request.source_name),
            )),
        }
    }
}
