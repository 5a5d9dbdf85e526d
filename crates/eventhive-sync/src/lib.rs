//! Crawl pipeline orchestration: source registry, merge and scheduled runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use eventhive_adapters::ExtractorRegistry;
use eventhive_core::{DedupKey, EventCandidate, Source};
use eventhive_storage::{
    BrowserPageFetcher, BrowserSettings, EventStore, FetchError, FetchRequest, FixturePageFetcher,
    HttpFetcherConfig, HttpPageFetcher, InMemoryStore, PageFetcher, PageSnapshotStore, PgStore,
    SourceStore, StoreError,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "eventhive-sync";

const DEFAULT_CRAWL_CRON: &str = "0 0 */6 * * *";
// Headroom over navigation + selector timeouts before a crawl is cut off.
const CRAWL_DEADLINE_SLACK: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Browser,
    Http,
    Fixtures,
}

impl FromStr for FetchMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "browser" => Ok(FetchMode::Browser),
            "http" => Ok(FetchMode::Http),
            "fixtures" => Ok(FetchMode::Fixtures),
            other => Err(format!("unknown fetch mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub fetch_mode: FetchMode,
    pub fixtures_dir: PathBuf,
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
    pub max_render_contexts: usize,
    pub max_concurrent_sources: usize,
    pub user_agent: String,
    pub chromium_path: Option<PathBuf>,
    pub browser_sandbox: bool,
    pub snapshot_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub crawl_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(default)
        };
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let fetch_mode = match lookup("EVENTHIVE_FETCH_MODE") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(error = %e, "falling back to browser fetch mode");
                FetchMode::Browser
            }),
            None => FetchMode::Browser,
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            fetch_mode,
            fixtures_dir: lookup("EVENTHIVE_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            navigation_timeout: Duration::from_secs(number("EVENTHIVE_NAV_TIMEOUT_SECS", 60)),
            selector_timeout: Duration::from_secs(number("EVENTHIVE_SELECTOR_TIMEOUT_SECS", 30)),
            max_render_contexts: number("EVENTHIVE_MAX_RENDER_CONTEXTS", 3).max(1) as usize,
            max_concurrent_sources: number("EVENTHIVE_MAX_CONCURRENT_SOURCES", 4).max(1) as usize,
            user_agent: lookup("EVENTHIVE_USER_AGENT")
                .unwrap_or_else(|| "eventhive-bot/0.1".to_string()),
            chromium_path: lookup("CHROMIUM_PATH").map(PathBuf::from),
            browser_sandbox: flag("EVENTHIVE_BROWSER_SANDBOX", true),
            snapshot_dir: lookup("EVENTHIVE_SNAPSHOT_DIR").map(PathBuf::from),
            scheduler_enabled: flag("EVENTHIVE_SCHEDULER_ENABLED", false),
            crawl_cron: lookup("EVENTHIVE_CRAWL_CRON")
                .unwrap_or_else(|| DEFAULT_CRAWL_CRON.to_string()),
            web_port: number("EVENTHIVE_WEB_PORT", 8000).min(u16::MAX as u64) as u16,
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            navigation_timeout: self.navigation_timeout,
            selector_timeout: self.selector_timeout,
            max_concurrent_sources: self.max_concurrent_sources,
        }
    }

    pub fn build_fetcher(&self) -> Result<Arc<dyn PageFetcher>> {
        let fetcher: Arc<dyn PageFetcher> = match self.fetch_mode {
            FetchMode::Browser => Arc::new(BrowserPageFetcher::new(BrowserSettings {
                executable: self.chromium_path.clone(),
                user_agent: Some(self.user_agent.clone()),
                max_contexts: self.max_render_contexts,
                sandbox: self.browser_sandbox,
            })),
            FetchMode::Http => Arc::new(HttpPageFetcher::new(HttpFetcherConfig {
                user_agent: Some(self.user_agent.clone()),
                max_in_flight: self.max_render_contexts,
                ..Default::default()
            })?),
            FetchMode::Fixtures => Arc::new(
                FixturePageFetcher::from_dir(&self.fixtures_dir)
                    .with_context(|| format!("loading fixtures from {}", self.fixtures_dir.display()))?,
            ),
        };
        Ok(fetcher)
    }
}

/// The catalog a fresh deployment starts with.
pub fn seed_sources() -> Vec<Source> {
    vec![
        Source::new("Unstop", "https://unstop.com/hackathons").with_logo(
            "https://d8it4huxumps7.cloudfront.net/uploads/images/unstop/branding/unstop-icon-192.png",
        ),
        Source::new("Devfolio", "https://devfolio.co/hackathons").with_logo(
            "https://assets.devfolio.co/company/e19b9016c0f8469e9d09b7312d3a63d7/assets/favicons/favicon-32x32.png",
        ),
        Source::new("MLH", "https://mlh.io/seasons/2025/events").with_logo(
            "https://mlh.io/assets/logos/mlh-logo-color-dark-29d0396cab07f7f4f28e9deeb03c77b2c2e1ca3f76bb69e834aceb57a1fd5322.svg",
        ),
        Source::new("HackerEarth", "https://www.hackerearth.com/challenges/hackathon/").with_logo(
            "https://static-fastly.hackerearth.com/static/hackerearth/images/logo/HE_logo.png",
        ),
    ]
}

/// Stage a crawl was in; a failure records where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrawlState {
    Pending,
    Fetching,
    Extracting,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CrawlState::Pending => "pending",
            CrawlState::Fetching => "fetching",
            CrawlState::Extracting => "extracting",
            CrawlState::Merging => "merging",
            CrawlState::Done => "done",
            CrawlState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("scraper source `{0}` not found")]
    NotFound(String),
    #[error("scraper source `{0}` is disabled")]
    SourceDisabled(String),
    #[error("no extractor registered for source `{0}`")]
    UnknownSource(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("{name} failed while {stage}: {cause}")]
pub struct SourceError {
    pub name: String,
    pub stage: CrawlState,
    #[source]
    pub cause: CrawlError,
}

impl SourceError {
    fn new(name: impl Into<String>, stage: CrawlState, cause: impl Into<CrawlError>) -> Self {
        Self {
            name: name.into(),
            stage,
            cause: cause.into(),
        }
    }
}

/// Catalog of crawl targets on top of a `SourceStore`.
pub struct SourceRegistry {
    store: Arc<dyn SourceStore>,
    gate: RwLock<()>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn SourceStore>) -> Self {
        Self {
            store,
            gate: RwLock::new(()),
        }
    }

    /// Seeds the catalog when it is empty. Returns how many sources were added.
    pub async fn bootstrap(&self) -> Result<usize, StoreError> {
        let _exclusive = self.gate.write().await;
        if self.store.count_sources().await? != 0 {
            return Ok(0);
        }
        let seed = seed_sources();
        self.store.insert_many_sources(&seed).await?;
        info!(count = seed.len(), "seeded scraper sources");
        Ok(seed.len())
    }

    pub async fn list_all(&self) -> Result<Vec<Source>, StoreError> {
        let _shared = self.gate.read().await;
        self.store.list_sources().await
    }

    pub async fn list_enabled(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|s| s.is_enabled)
            .collect())
    }

    pub async fn find(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let _shared = self.gate.read().await;
        self.store.find_source_by_name(name).await
    }

    pub async fn toggle(&self, name: &str, enabled: bool) -> Result<Source, CrawlError> {
        let _shared = self.gate.read().await;
        let updated = self
            .store
            .update_source_enabled(name, enabled)
            .await?
            .ok_or_else(|| CrawlError::NotFound(name.to_string()))?;
        info!(source = name, enabled, "scraper source toggled");
        Ok(updated)
    }

    pub async fn mark_scraped(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.mark_source_scraped(name, at).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub inserted_count: usize,
    pub skipped_count: usize,
}

/// Check-then-insert against an `EventStore`, first write wins.
///
/// Each (title, source) key is merged under its own lock, so concurrent
/// merges sharing an engine cannot both insert the same key. A store-level
/// `Conflict` counts as a skip.
#[derive(Default)]
pub struct MergeEngine {
    key_locks: Mutex<HashMap<DedupKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn merge(
        &self,
        candidates: &[EventCandidate],
        store: &dyn EventStore,
    ) -> Result<MergeOutcome, StoreError> {
        let mut outcome = MergeOutcome::default();
        let mut seen = HashSet::new();
        for candidate in candidates {
            let key = candidate.dedup_key();
            if !seen.insert(key.clone()) {
                debug!(key = %key, "duplicate within batch");
                outcome.skipped_count += 1;
                continue;
            }
            if self.merge_one(candidate, &key, store).await? {
                outcome.inserted_count += 1;
            } else {
                outcome.skipped_count += 1;
            }
        }
        Ok(outcome)
    }

    async fn merge_one(
        &self,
        candidate: &EventCandidate,
        key: &DedupKey,
        store: &dyn EventStore,
    ) -> Result<bool, StoreError> {
        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().await;
            self.check_then_insert(candidate, key, store).await
        };
        drop(lock);
        self.release(key);
        result
    }

    async fn check_then_insert(
        &self,
        candidate: &EventCandidate,
        key: &DedupKey,
        store: &dyn EventStore,
    ) -> Result<bool, StoreError> {
        if store
            .find_event_by_title_and_source(&candidate.title, &candidate.source)
            .await?
            .is_some()
        {
            debug!(key = %key, "already stored");
            return Ok(false);
        }
        match store.insert_event(candidate).await {
            Ok(stored) => {
                debug!(key = %key, id = %stored.id, "inserted");
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(key = %key, "insert lost a race; skipping");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn lock_for(&self, key: &DedupKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &DedupKey) {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    pub navigation_timeout: Duration,
    pub selector_timeout: Duration,
    pub max_concurrent_sources: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: eventhive_storage::DEFAULT_NAVIGATION_TIMEOUT,
            selector_timeout: eventhive_storage::DEFAULT_SELECTOR_TIMEOUT,
            max_concurrent_sources: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRunSummary {
    pub source: String,
    pub events_scraped: usize,
    pub inserted_count: usize,
    pub skipped_count: usize,
    pub events: Vec<EventCandidate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SourceOutcome {
    #[serde(rename_all = "camelCase")]
    Succeeded {
        events_scraped: usize,
        inserted: usize,
        skipped: usize,
    },
    Failed { stage: CrawlState, error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAllSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_inserted: usize,
    pub events_count: usize,
    pub succeeded_sources: Vec<String>,
    pub failed_sources: Vec<String>,
    pub outcomes: BTreeMap<String, SourceOutcome>,
}

pub struct Orchestrator {
    registry: SourceRegistry,
    events: Arc<dyn EventStore>,
    fetcher: Arc<dyn PageFetcher>,
    extractors: ExtractorRegistry,
    merge: MergeEngine,
    snapshots: Option<PageSnapshotStore>,
    settings: CrawlSettings,
}

impl Orchestrator {
    pub fn new<S>(store: Arc<S>, fetcher: Arc<dyn PageFetcher>, extractors: ExtractorRegistry) -> Self
    where
        S: EventStore + SourceStore + 'static,
    {
        Self {
            registry: SourceRegistry::new(store.clone()),
            events: store,
            fetcher,
            extractors,
            merge: MergeEngine::new(),
            snapshots: None,
            settings: CrawlSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CrawlSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_snapshots(mut self, snapshots: PageSnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Fails naming every enabled source without an extractor.
    pub async fn verify_extractors(&self) -> Result<()> {
        let enabled = self.registry.list_enabled().await?;
        self.extractors
            .ensure_covers(enabled.iter().map(|s| s.name.as_str()))
            .context("checking extractor coverage")
    }

    pub async fn run_one(&self, source_name: &str) -> Result<SourceRunSummary, SourceError> {
        let source = self
            .registry
            .find(source_name)
            .await
            .map_err(|e| SourceError::new(source_name, CrawlState::Pending, e))?
            .ok_or_else(|| {
                SourceError::new(
                    source_name,
                    CrawlState::Pending,
                    CrawlError::NotFound(source_name.to_string()),
                )
            })?;
        if !source.is_enabled {
            return Err(SourceError::new(
                &source.name,
                CrawlState::Pending,
                CrawlError::SourceDisabled(source.name.clone()),
            ));
        }
        let span = info_span!("crawl_source", source = %source.name);
        self.crawl_source(&source).instrument(span).await
    }

    /// Crawls every enabled source; one source failing never stops the others.
    pub async fn run_all(&self) -> Result<RunAllSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let sources = self.registry.list_enabled().await?;
        info!(%run_id, sources = sources.len(), "crawl run started");

        let results: Vec<(String, Result<SourceRunSummary, SourceError>)> = stream::iter(sources)
            .map(|source| {
                let span = info_span!("crawl_source", source = %source.name, %run_id);
                async move {
                    let result = self.crawl_source(&source).await;
                    (source.name, result)
                }
                .instrument(span)
            })
            .buffer_unordered(self.settings.max_concurrent_sources.max(1))
            .collect()
            .await;

        let mut summary = RunAllSummary {
            run_id,
            started_at,
            finished_at: started_at,
            total_inserted: 0,
            events_count: 0,
            succeeded_sources: Vec::new(),
            failed_sources: Vec::new(),
            outcomes: BTreeMap::new(),
        };
        for (name, result) in results {
            let outcome = match result {
                Ok(run) => {
                    summary.total_inserted += run.inserted_count;
                    summary.events_count += run.events_scraped;
                    summary.succeeded_sources.push(name.clone());
                    SourceOutcome::Succeeded {
                        events_scraped: run.events_scraped,
                        inserted: run.inserted_count,
                        skipped: run.skipped_count,
                    }
                }
                Err(err) => {
                    warn!(%run_id, source = %name, stage = %err.stage, error = %err.cause, "source crawl failed");
                    summary.failed_sources.push(name.clone());
                    SourceOutcome::Failed {
                        stage: err.stage,
                        error: err.cause.to_string(),
                    }
                }
            };
            summary.outcomes.insert(name, outcome);
        }
        summary.succeeded_sources.sort();
        summary.failed_sources.sort();
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            inserted = summary.total_inserted,
            scraped = summary.events_count,
            failed = summary.failed_sources.len(),
            "crawl run finished"
        );
        Ok(summary)
    }

    async fn crawl_source(&self, source: &Source) -> Result<SourceRunSummary, SourceError> {
        let started_at = Utc::now();
        let mut state = CrawlState::Pending;
        let fail = |stage: CrawlState, cause: CrawlError| {
            debug!(from = %stage, to = %CrawlState::Failed, "crawl state");
            SourceError::new(&source.name, stage, cause)
        };

        let extractor = self.extractors.get(&source.name).ok_or_else(|| {
            fail(state, CrawlError::UnknownSource(source.name.clone()))
        })?;

        advance(&mut state, CrawlState::Fetching);
        let request = FetchRequest::new(&source.name, &source.url)
            .with_wait_selector(extractor.wait_selector())
            .with_timeouts(self.settings.navigation_timeout, self.settings.selector_timeout);
        // Queueing for a rendering context is not part of the crawl deadline.
        let slot = self
            .fetcher
            .reserve(&request)
            .await
            .map_err(|e| fail(state, e.into()))?;
        let deadline =
            self.settings.navigation_timeout + self.settings.selector_timeout + CRAWL_DEADLINE_SLACK;
        let page = match tokio::time::timeout(deadline, self.fetcher.fetch(slot, &request)).await {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => return Err(fail(state, e.into())),
            Err(_) => {
                return Err(fail(
                    state,
                    FetchError::navigation_timeout(&source.url, deadline).into(),
                ))
            }
        };

        if let Some(snapshots) = &self.snapshots {
            match snapshots.store_page(&page).await {
                Ok(stored) => debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "page snapshot"),
                Err(e) => warn!(error = %e, "page snapshot failed"),
            }
        }

        advance(&mut state, CrawlState::Extracting);
        let events = extractor.extract(&page, Utc::now());
        if events.is_empty() {
            warn!(url = %page.url, "no events extracted");
        }

        advance(&mut state, CrawlState::Merging);
        let merged = self
            .merge
            .merge(&events, self.events.as_ref())
            .await
            .map_err(|e| fail(state, e.into()))?;

        let finished_at = Utc::now();
        if let Err(e) = self.registry.mark_scraped(&source.name, finished_at).await {
            warn!(error = %e, "could not stamp lastScraped");
        }
        advance(&mut state, CrawlState::Done);
        info!(
            scraped = events.len(),
            inserted = merged.inserted_count,
            skipped = merged.skipped_count,
            "source crawled"
        );

        Ok(SourceRunSummary {
            source: source.name.clone(),
            events_scraped: events.len(),
            inserted_count: merged.inserted_count,
            skipped_count: merged.skipped_count,
            events,
            started_at,
            finished_at,
        })
    }
}

fn advance(state: &mut CrawlState, next: CrawlState) {
    debug!(from = %state, to = %next, "crawl state");
    *state = next;
}

/// Store, fetcher and extractors wired from configuration, with the source
/// catalog bootstrapped and extractor coverage checked.
pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<Orchestrator> {
    let fetcher = config.build_fetcher()?;
    let extractors = ExtractorRegistry::with_defaults().context("building extractor registry")?;
    let orchestrator = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Orchestrator::new(Arc::new(store), fetcher, extractors)
        }
        None => {
            warn!("DATABASE_URL not set; events are kept in memory only");
            Orchestrator::new(Arc::new(InMemoryStore::new()), fetcher, extractors)
        }
    };
    let mut orchestrator = orchestrator.with_settings(config.crawl_settings());
    if let Some(dir) = &config.snapshot_dir {
        orchestrator = orchestrator.with_snapshots(PageSnapshotStore::new(dir.clone()));
    }
    orchestrator
        .registry()
        .bootstrap()
        .await
        .context("bootstrapping scraper sources")?;
    orchestrator.verify_extractors().await?;
    Ok(orchestrator)
}

/// Scheduler running `run_all` on `config.crawl_cron`, or `None` when disabled.
/// The caller starts it.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.crawl_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_all().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.total_inserted,
                    failed = ?summary.failed_sources,
                    "scheduled crawl finished"
                ),
                Err(e) => error!(error = %e, "scheduled crawl could not list sources"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventhive_storage::{FetchErrorKind, FetchSlot, RenderedPage};
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .canonicalize()
            .expect("fixtures root")
    }

    async fn seeded_orchestrator(
        fetcher: Arc<dyn PageFetcher>,
    ) -> (Orchestrator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            ExtractorRegistry::with_defaults().unwrap(),
        );
        orchestrator.registry().bootstrap().await.unwrap();
        (orchestrator, store)
    }

    /// Fixture pages served after `delay`, at most `contexts` at a time.
    struct SlowFetcher {
        pages: FixturePageFetcher,
        contexts: Arc<Semaphore>,
        delay: Duration,
    }

    #[async_trait]
    impl PageFetcher for SlowFetcher {
        async fn reserve(&self, request: &FetchRequest) -> Result<FetchSlot, FetchError> {
            FetchSlot::acquire(&self.contexts, &request.url).await
        }

        async fn fetch(&self, slot: FetchSlot, request: &FetchRequest) -> Result<RenderedPage, FetchError> {
            tokio::time::sleep(self.delay).await;
            self.pages.fetch(slot, request).await
        }
    }

    struct ContextGuard(Arc<AtomicBool>);

    impl Drop for ContextGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Opens a context and never produces a page.
    struct HangingFetcher {
        contexts: Arc<Semaphore>,
        released: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PageFetcher for HangingFetcher {
        async fn reserve(&self, request: &FetchRequest) -> Result<FetchSlot, FetchError> {
            FetchSlot::acquire(&self.contexts, &request.url).await
        }

        async fn fetch(&self, _slot: FetchSlot, _request: &FetchRequest) -> Result<RenderedPage, FetchError> {
            let _context = ContextGuard(self.released.clone());
            std::future::pending().await
        }
    }

    fn candidate(title: &str, source: &str) -> EventCandidate {
        EventCandidate::new(title, "Org", "TBD", source)
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::default();
        assert_eq!(defaults.database_url, None);
        assert_eq!(defaults.fetch_mode, FetchMode::Browser);
        assert_eq!(defaults.navigation_timeout, Duration::from_secs(60));
        assert_eq!(defaults.selector_timeout, Duration::from_secs(30));
        assert_eq!(defaults.max_render_contexts, 3);
        assert_eq!(defaults.crawl_cron, "0 0 */6 * * *");
        assert_eq!(defaults.web_port, 8000);
        assert!(defaults.browser_sandbox);

        let config = SyncConfig::from_lookup(|key| match key {
            "EVENTHIVE_FETCH_MODE" => Some("Fixtures".into()),
            "EVENTHIVE_MAX_CONCURRENT_SOURCES" => Some("0".into()),
            "EVENTHIVE_SCHEDULER_ENABLED" => Some("true".into()),
            "DATABASE_URL" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config.fetch_mode, FetchMode::Fixtures);
        assert_eq!(config.max_concurrent_sources, 1);
        assert!(config.scheduler_enabled);
        assert_eq!(config.database_url, None);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let registry = SourceRegistry::new(store.clone());
        assert_eq!(registry.bootstrap().await.unwrap(), 4);
        assert_eq!(registry.bootstrap().await.unwrap(), 0);
        let names: Vec<_> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Devfolio", "HackerEarth", "MLH", "Unstop"]);
    }

    #[tokio::test]
    async fn concurrent_bootstrap_seeds_once() {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(SourceRegistry::new(store.clone()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.bootstrap().await.unwrap() })
            })
            .collect();
        let mut seeded = 0;
        for handle in handles {
            seeded += handle.await.unwrap();
        }
        assert_eq!(seeded, 4);
        assert_eq!(store.count_sources().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn toggle_updates_or_reports_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let registry = SourceRegistry::new(store);
        registry.bootstrap().await.unwrap();

        let updated = registry.toggle("MLH", false).await.unwrap();
        assert!(!updated.is_enabled);
        let enabled: Vec<_> = registry
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(enabled, vec!["Devfolio", "HackerEarth", "Unstop"]);

        assert!(matches!(
            registry.toggle("Kaggle", true).await,
            Err(CrawlError::NotFound(name)) if name == "Kaggle"
        ));
    }

    #[tokio::test]
    async fn merge_skips_events_already_stored() {
        let store = InMemoryStore::new();
        store.seed_event(candidate("X", "Devfolio")).await;
        let outcome = MergeEngine::new()
            .merge(&[candidate("X", "Devfolio")], &store)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome {
                inserted_count: 0,
                skipped_count: 1
            }
        );
    }

    #[tokio::test]
    async fn merge_keeps_first_occurrence_within_batch() {
        let store = InMemoryStore::permissive();
        let mut first = candidate("Same", "MLH");
        first.date = "first".into();
        let mut second = candidate("Same", "MLH");
        second.date = "second".into();
        let outcome = MergeEngine::new()
            .merge(&[first, second, candidate("Other", "MLH")], &store)
            .await
            .unwrap();
        assert_eq!(outcome.inserted_count, 2);
        assert_eq!(outcome.skipped_count, 1);
        let events = store.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.date, "first");
    }

    #[tokio::test]
    async fn merge_never_overwrites_stored_fields() {
        let store = InMemoryStore::new();
        let mut original = candidate("Keep", "Unstop");
        original.organizer = "Original Org".into();
        store.seed_event(original).await;

        let mut changed = candidate("Keep", "Unstop");
        changed.organizer = "Changed Org".into();
        MergeEngine::new().merge(&[changed], &store).await.unwrap();

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.organizer, "Original Org");
    }

    #[tokio::test]
    async fn store_conflict_counts_as_skip() {
        // Separate engines share no key locks; both lookups miss and the
        // unique store rejects the second insert.
        let store = Arc::new(InMemoryStore::new().with_lookup_delay(Duration::from_millis(20)));
        let batch = vec![candidate("Race", "HackerEarth")];
        let a = MergeEngine::new();
        let b = MergeEngine::new();
        let (ra, rb) = tokio::join!(a.merge(&batch, store.as_ref()), b.merge(&batch, store.as_ref()));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.inserted_count + rb.inserted_count, 1);
        assert_eq!(ra.skipped_count + rb.skipped_count, 1);
        assert_eq!(store.count_events().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_merges_without_store_constraint_insert_once() {
        let store = Arc::new(InMemoryStore::permissive().with_lookup_delay(Duration::from_millis(10)));
        let engine = Arc::new(MergeEngine::new());
        let batch: Vec<_> = ["A", "B", "C"].iter().map(|t| candidate(t, "Devfolio")).collect();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let store = store.clone();
                let engine = engine.clone();
                let batch = batch.clone();
                tokio::spawn(async move { engine.merge(&batch, store.as_ref()).await.unwrap() })
            })
            .collect();
        let mut inserted = 0;
        for handle in handles {
            inserted += handle.await.unwrap().inserted_count;
        }
        assert_eq!(inserted, 3);
        assert_eq!(store.count_events().await.unwrap(), 3);
        assert_eq!(engine.tracked_keys(), 0);
    }

    proptest! {
        #[test]
        fn merge_leaves_distinct_keys_and_accounts_for_every_candidate(
            titles in proptest::collection::vec("[abc]{1,2}", 0..24),
            sources in proptest::collection::vec(prop_oneof![Just("MLH"), Just("Unstop")], 24),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = InMemoryStore::permissive();
            let engine = MergeEngine::new();
            let batch: Vec<_> = titles
                .iter()
                .zip(sources.iter())
                .map(|(t, s)| candidate(t, s))
                .collect();
            let half = batch.len() / 2;

            let (first, second) = runtime.block_on(async {
                let first = engine.merge(&batch[..half], &store).await.unwrap();
                let second = engine.merge(&batch[half..], &store).await.unwrap();
                (first, second)
            });
            prop_assert_eq!(first.inserted_count + first.skipped_count, half);
            prop_assert_eq!(second.inserted_count + second.skipped_count, batch.len() - half);

            let events = runtime.block_on(store.events());
            let distinct: HashSet<_> = batch.iter().map(|c| c.dedup_key()).collect();
            prop_assert_eq!(events.len(), distinct.len());
            let stored: HashSet<_> = events.iter().map(|e| e.dedup_key()).collect();
            prop_assert_eq!(stored.len(), events.len());
        }
    }

    #[tokio::test]
    async fn run_one_is_idempotent() {
        let fetcher = Arc::new(FixturePageFetcher::from_dir(fixtures_root()).unwrap());
        let (orchestrator, store) = seeded_orchestrator(fetcher).await;

        let first = orchestrator.run_one("MLH").await.unwrap();
        assert_eq!(first.events_scraped, 2);
        assert_eq!(first.inserted_count, 2);

        let second = orchestrator.run_one("MLH").await.unwrap();
        assert_eq!(second.events_scraped, 2);
        assert_eq!(second.inserted_count, 0);
        assert_eq!(second.skipped_count, 2);
        assert_eq!(store.count_events().await.unwrap(), 2);

        let mlh = orchestrator.registry().find("MLH").await.unwrap().unwrap();
        assert!(mlh.last_scraped.is_some());
    }

    #[tokio::test]
    async fn run_one_rejects_unknown_and_disabled_sources() {
        let fetcher = Arc::new(FixturePageFetcher::from_dir(fixtures_root()).unwrap());
        let (orchestrator, _store) = seeded_orchestrator(fetcher.clone()).await;

        let err = orchestrator.run_one("Kaggle").await.unwrap_err();
        assert!(matches!(err.cause, CrawlError::NotFound(_)));

        orchestrator.registry().toggle("Devfolio", false).await.unwrap();
        let err = orchestrator.run_one("Devfolio").await.unwrap_err();
        assert!(matches!(err.cause, CrawlError::SourceDisabled(_)));
        assert_eq!(err.stage, CrawlState::Pending);
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn run_one_reports_fetch_stage_failures() {
        let fetcher = Arc::new(
            FixturePageFetcher::from_dir(fixtures_root())
                .unwrap()
                .with_failure("Unstop", FetchErrorKind::NavigationTimeout),
        );
        let (orchestrator, _store) = seeded_orchestrator(fetcher).await;
        let err = orchestrator.run_one("Unstop").await.unwrap_err();
        assert_eq!(err.name, "Unstop");
        assert_eq!(err.stage, CrawlState::Fetching);
        match err.cause {
            CrawlError::Fetch(fetch) => assert_eq!(fetch.kind, FetchErrorKind::NavigationTimeout),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enabled_source_without_extractor_fails_alone() {
        let fetcher = Arc::new(FixturePageFetcher::from_dir(fixtures_root()).unwrap());
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_many_sources(&[Source::new("Kaggle", "https://www.kaggle.com/competitions")])
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            ExtractorRegistry::with_defaults().unwrap(),
        );
        // A non-empty catalog is never seeded, so add the defaults by hand.
        assert_eq!(orchestrator.registry().bootstrap().await.unwrap(), 0);
        store.insert_many_sources(&seed_sources()).await.unwrap();

        assert!(orchestrator.verify_extractors().await.is_err());
        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.failed_sources, vec!["Kaggle"]);
        assert_eq!(summary.succeeded_sources.len(), 4);
        assert!(matches!(
            summary.outcomes.get("Kaggle"),
            Some(SourceOutcome::Failed { stage: CrawlState::Pending, .. })
        ));
    }

    #[tokio::test]
    async fn run_all_isolates_a_failing_source() {
        let fetcher = Arc::new(
            FixturePageFetcher::from_dir(fixtures_root())
                .unwrap()
                .with_failure("Devfolio", FetchErrorKind::NavigationFailed),
        );
        let (orchestrator, store) = seeded_orchestrator(fetcher).await;

        let summary = orchestrator.run_all().await.unwrap();
        assert_eq!(summary.failed_sources, vec!["Devfolio"]);
        assert_eq!(summary.succeeded_sources, vec!["HackerEarth", "MLH", "Unstop"]);
        for name in &summary.succeeded_sources {
            match summary.outcomes.get(name) {
                Some(SourceOutcome::Succeeded { events_scraped, .. }) => assert!(*events_scraped > 0),
                other => panic!("unexpected outcome for {name}: {other:?}"),
            }
        }
        assert_eq!(summary.total_inserted, 6);
        assert_eq!(summary.events_count, 6);
        assert_eq!(store.count_events().await.unwrap(), 6);

        let rerun = orchestrator.run_all().await.unwrap();
        assert_eq!(rerun.total_inserted, 0);
        assert_eq!(rerun.events_count, 6);
    }

    #[tokio::test]
    async fn run_all_skips_disabled_sources() {
        let fetcher = Arc::new(FixturePageFetcher::from_dir(fixtures_root()).unwrap());
        let (orchestrator, _store) = seeded_orchestrator(fetcher.clone()).await;
        orchestrator.registry().toggle("HackerEarth", false).await.unwrap();

        let summary = orchestrator.run_all().await.unwrap();
        assert!(!summary.outcomes.contains_key("HackerEarth"));
        assert_eq!(fetcher.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_context_does_not_eat_into_the_deadline() {
        // Each fetch takes 80s of a 105s deadline; the fourth source has to
        // queue behind the other three for a context.
        let fetcher = Arc::new(SlowFetcher {
            pages: FixturePageFetcher::from_dir(fixtures_root()).unwrap(),
            contexts: Arc::new(Semaphore::new(3)),
            delay: Duration::from_secs(80),
        });
        let (orchestrator, store) = seeded_orchestrator(fetcher.clone()).await;

        let summary = orchestrator.run_all().await.unwrap();
        assert!(summary.failed_sources.is_empty(), "{:?}", summary.outcomes);
        assert_eq!(
            summary.succeeded_sources,
            vec!["Devfolio", "HackerEarth", "MLH", "Unstop"]
        );
        assert_eq!(summary.total_inserted, 8);
        assert_eq!(store.count_events().await.unwrap(), 8);
        assert_eq!(fetcher.contexts.available_permits(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out_and_releases_its_context() {
        let released = Arc::new(AtomicBool::new(false));
        let fetcher = Arc::new(HangingFetcher {
            contexts: Arc::new(Semaphore::new(1)),
            released: released.clone(),
        });
        let (orchestrator, _store) = seeded_orchestrator(fetcher.clone()).await;

        let err = orchestrator.run_one("Devfolio").await.unwrap_err();
        assert_eq!(err.name, "Devfolio");
        assert_eq!(err.stage, CrawlState::Fetching);
        match &err.cause {
            CrawlError::Fetch(fetch) => {
                assert_eq!(fetch.kind, FetchErrorKind::NavigationTimeout);
                assert!(fetch.detail.contains("105s"), "{}", fetch.detail);
            }
            other => panic!("unexpected cause: {other:?}"),
        }
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(fetcher.contexts.available_permits(), 1);

        // With a single context, a leaked one would hang this crawl.
        let err = orchestrator.run_one("MLH").await.unwrap_err();
        assert_eq!(err.stage, CrawlState::Fetching);
        assert_eq!(fetcher.contexts.available_permits(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_archived_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FixturePageFetcher::from_dir(fixtures_root()).unwrap());
        let (orchestrator, _store) = seeded_orchestrator(fetcher).await;
        let orchestrator = orchestrator.with_snapshots(PageSnapshotStore::new(dir.path()));

        orchestrator.run_one("HackerEarth").await.unwrap();
        let mut stamps = std::fs::read_dir(dir.path()).unwrap();
        let stamp = stamps.next().unwrap().unwrap().path();
        assert!(stamp.join("hackerearth").is_dir());
    }

    #[test]
    fn run_summary_serializes_outcomes_by_status() {
        let outcome = SourceOutcome::Failed {
            stage: CrawlState::Fetching,
            error: "boom".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "Fetching");
    }
}
