//! Headless-browser page fetcher.
//!
//! Every fetch launches its own browser with a throwaway profile directory and
//! tears it down before returning. Nothing is shared between crawls except
//! the semaphore that caps how many browsers run at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::fetch::{FetchError, FetchRequest, FetchSlot, PageFetcher, RenderedPage};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub max_contexts: usize,
    /// Chrome's own sandbox; containers without user namespaces need it off.
    pub sandbox: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            user_agent: None,
            max_contexts: 3,
            sandbox: true,
        }
    }
}

#[derive(Debug)]
pub struct BrowserPageFetcher {
    settings: BrowserSettings,
    contexts: Arc<Semaphore>,
}

impl BrowserPageFetcher {
    pub fn new(settings: BrowserSettings) -> Self {
        let contexts = Arc::new(Semaphore::new(settings.max_contexts.max(1)));
        Self { settings, contexts }
    }

    pub fn available_contexts(&self) -> usize {
        self.contexts.available_permits()
    }
}

#[async_trait]
impl PageFetcher for BrowserPageFetcher {
    async fn reserve(&self, request: &FetchRequest) -> Result<FetchSlot, FetchError> {
        FetchSlot::acquire(&self.contexts, &request.url).await
    }

    async fn fetch(&self, _slot: FetchSlot, request: &FetchRequest) -> Result<RenderedPage, FetchError> {
        let span = info_span!("browser_fetch", source = %request.source_name, url = %request.url);
        async {
            let mut context = RenderingContext::launch(&self.settings, &request.url).await?;
            let rendered = context.render(request).await;
            context.close().await;

            let (final_url, html) = rendered?;
            Ok(RenderedPage {
                source_name: request.source_name.clone(),
                url: final_url,
                html,
                fetched_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }
}

/// One browser process plus its CDP event loop and profile directory.
///
/// `close` is the orderly path. If the owning future is dropped first (an
/// outer timeout), `Drop` aborts the event loop and the browser process is
/// killed when `Browser` drops; the profile directory goes with `TempDir`.
struct RenderingContext {
    browser: Browser,
    handler: JoinHandle<()>,
    _profile: TempDir,
}

impl RenderingContext {
    async fn launch(settings: &BrowserSettings, url: &str) -> Result<Self, FetchError> {
        let profile = tempfile::Builder::new()
            .prefix("eventhive-chrome-")
            .tempdir()
            .map_err(|e| FetchError::navigation_failed(url, format!("creating browser profile: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .headless_mode(HeadlessMode::default())
            .user_data_dir(profile.path())
            .window_size(1366, 900)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .arg("--mute-audio");
        if !settings.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(path) = &settings.executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(user_agent) = &settings.user_agent {
            builder = builder.arg(format!("--user-agent={user_agent}"));
        }
        let config = builder
            .build()
            .map_err(|e| FetchError::navigation_failed(url, format!("browser config: {e}")))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::navigation_failed(url, format!("launching browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!(error = ?e, "browser event loop error");
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            _profile: profile,
        })
    }

    async fn render(&self, request: &FetchRequest) -> Result<(String, String), FetchError> {
        let url = request.url.as_str();
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::navigation_failed(url, format!("opening tab: {e}")))?;

        match tokio::time::timeout(request.navigation_timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(FetchError::navigation_failed(url, e)),
            Err(_) => return Err(FetchError::navigation_timeout(url, request.navigation_timeout)),
        }

        if let Some(selector) = request.wait_selector.as_deref() {
            wait_for_selector(&page, url, selector, request.selector_timeout).await?;
        }

        let html = page
            .content()
            .await
            .map_err(|e| FetchError::navigation_failed(url, format!("reading DOM: {e}")))?;
        let final_url = page.url().await.ok().flatten().unwrap_or_else(|| url.to_string());
        Ok((final_url, html))
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "browser did not close cleanly");
        }
        if let Err(e) = self.browser.wait().await {
            warn!(error = %e, "waiting for browser exit failed");
        }
        self.handler.abort();
    }
}

impl Drop for RenderingContext {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

async fn wait_for_selector(
    page: &Page,
    url: &str,
    selector: &str,
    timeout: Duration,
) -> Result<(), FetchError> {
    let started = Instant::now();
    loop {
        match page.find_element(selector).await {
            Ok(_) => {
                debug!(selector, waited_ms = started.elapsed().as_millis() as u64, "wait selector present");
                return Ok(());
            }
            Err(e) if !selector_absent(&e) => {
                return Err(FetchError::navigation_failed(url, format!("waiting for `{selector}`: {e}")));
            }
            Err(_) => {}
        }
        if started.elapsed() >= timeout {
            return Err(FetchError::selector_timeout(url, selector, timeout));
        }
        tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
    }
}

/// A query for a node that is not in the DOM yet comes back as a protocol
/// error from Chrome (node id 0 does not resolve) or as `NotFound`. Anything
/// else means the tab or the connection is gone.
fn selector_absent(err: &CdpError) -> bool {
    matches!(err, CdpError::Chrome(_) | CdpError::NotFound)
}
