//! Persistence port, page fetchers and page snapshot archive.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventhive_core::{DedupKey, EventCandidate, Source, StoredEvent};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

mod browser;
mod fetch;
mod postgres;

pub use browser::{BrowserPageFetcher, BrowserSettings};
pub use fetch::{
    classify_reqwest_error, classify_status, html_has_selector, BackoffPolicy, FetchError,
    FetchErrorKind, FetchRequest, FetchSlot, FixturePageFetcher, HttpFetcherConfig, HttpPageFetcher,
    PageFetcher, RenderedPage, RetryDisposition, DEFAULT_NAVIGATION_TIMEOUT,
    DEFAULT_SELECTOR_TIMEOUT,
};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "eventhive-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// An event with the same title and source already exists. Merging treats
    /// this as a skip.
    #[error("event `{title}` from {source_name} already exists")]
    Conflict { title: String, source_name: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_event_by_title_and_source(
        &self,
        title: &str,
        source: &str,
    ) -> Result<Option<StoredEvent>, StoreError>;

    /// Fails with `StoreError::Conflict` when the store enforces uniqueness
    /// and the (title, source) pair is already taken.
    async fn insert_event(&self, candidate: &EventCandidate) -> Result<StoredEvent, StoreError>;

    async fn count_events(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All sources, ordered by name.
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn count_sources(&self) -> Result<usize, StoreError>;

    /// Inserts sources, ignoring names that already exist.
    async fn insert_many_sources(&self, sources: &[Source]) -> Result<(), StoreError>;

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError>;

    async fn update_source_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<Source>, StoreError>;

    async fn mark_source_scraped(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<StoredEvent>,
    index: HashMap<DedupKey, usize>,
    sources: BTreeMap<String, Source>,
}

/// Process-local store used when no database is configured, and in tests.
///
/// By default it enforces the (title, source) uniqueness a database index
/// would. `permissive()` drops that guarantee to model a store without one;
/// `with_lookup_delay` widens the check-then-insert window.
#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    unique_events: bool,
    lookup_delay: Option<Duration>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            unique_events: true,
            lookup_delay: None,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            unique_events: false,
            ..Self::default()
        }
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    pub async fn events(&self) -> Vec<StoredEvent> {
        self.state.read().await.events.clone()
    }

    pub async fn seed_event(&self, candidate: EventCandidate) -> StoredEvent {
        let stored = StoredEvent::from_candidate(candidate, Utc::now());
        let mut state = self.state.write().await;
        let position = state.events.len();
        state.index.entry(stored.dedup_key()).or_insert(position);
        state.events.push(stored.clone());
        stored
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn find_event_by_title_and_source(
        &self,
        title: &str,
        source: &str,
    ) -> Result<Option<StoredEvent>, StoreError> {
        let found = {
            let state = self.state.read().await;
            let key = DedupKey::new(title, source);
            state.index.get(&key).map(|&i| state.events[i].clone())
        };
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(found)
    }

    async fn insert_event(&self, candidate: &EventCandidate) -> Result<StoredEvent, StoreError> {
        let key = candidate.dedup_key();
        let mut state = self.state.write().await;
        if self.unique_events && state.index.contains_key(&key) {
            return Err(StoreError::Conflict {
                title: key.title,
                source_name: key.source,
            });
        }
        let stored = StoredEvent::from_candidate(candidate.clone(), Utc::now());
        let position = state.events.len();
        state.index.entry(key).or_insert(position);
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn count_events(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.events.len())
    }
}

#[async_trait]
impl SourceStore for InMemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }

    async fn count_sources(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.sources.len())
    }

    async fn insert_many_sources(&self, sources: &[Source]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for source in sources {
            state
                .sources
                .entry(source.name.clone())
                .or_insert_with(|| source.clone());
        }
        Ok(())
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        Ok(self.state.read().await.sources.get(name).cloned())
    }

    async fn update_source_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<Source>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.sources.get_mut(name).map(|source| {
            source.is_enabled = enabled;
            source.clone()
        }))
    }

    async fn mark_source_scraped(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(source) = self.state.write().await.sources.get_mut(name) {
            source.last_scraped = Some(at);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched DOMs. Captured pages become extractor
/// fixtures.
#[derive(Debug, Clone)]
pub struct PageSnapshotStore {
    root: PathBuf,
}

impl PageSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_name: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(source_slug(source_name))
            .join(format!("{content_hash}.html"))
    }

    /// Writes the page via temp file + rename; an identical page already on
    /// disk is reported as deduplicated.
    pub async fn store_page(&self, page: &fetch::RenderedPage) -> anyhow::Result<StoredSnapshot> {
        let bytes = page.html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.snapshot_relative_path(page.fetched_at, &page.source_name, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let snapshot = |deduplicated| StoredSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(snapshot(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(snapshot(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Lowercase, dash-separated directory name for a source.
pub fn source_slug(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
