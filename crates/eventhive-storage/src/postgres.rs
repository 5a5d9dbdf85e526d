//! Postgres-backed persistence port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventhive_core::{EventCandidate, EventStatus, Source, StoredEvent};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::{EventStore, SourceStore, StoreError};

const EVENT_COLUMNS: &str = "id, title, organizer, date, location, event_type, image_url, is_virtual, \
     description, registration_deadline, registration_url, skills, eligibility, prizes, source, \
     status, created_at, created_by, is_featured";

const SOURCE_COLUMNS: &str = "name, url, logo, is_enabled, last_scraped";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_event(row: &PgRow) -> Result<StoredEvent, sqlx::Error> {
    let status: Option<String> = row.try_get("status")?;
    Ok(StoredEvent {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        created_by: row.try_get("created_by")?,
        is_featured: row.try_get("is_featured")?,
        event: EventCandidate {
            title: row.try_get("title")?,
            organizer: row.try_get("organizer")?,
            date: row.try_get("date")?,
            location: row.try_get("location")?,
            event_type: row.try_get("event_type")?,
            image_url: row.try_get("image_url")?,
            is_virtual: row.try_get("is_virtual")?,
            description: row.try_get("description")?,
            registration_deadline: row.try_get("registration_deadline")?,
            registration_url: row.try_get("registration_url")?,
            skills: row.try_get("skills")?,
            eligibility: row.try_get("eligibility")?,
            prizes: row.try_get("prizes")?,
            source: row.try_get("source")?,
            status: status.as_deref().and_then(EventStatus::parse),
        },
    })
}

fn row_to_source(row: &PgRow) -> Result<Source, sqlx::Error> {
    Ok(Source {
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        logo: row.try_get("logo")?,
        is_enabled: row.try_get("is_enabled")?,
        last_scraped: row.try_get("last_scraped")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn find_event_by_title_and_source(
        &self,
        title: &str,
        source: &str,
    ) -> Result<Option<StoredEvent>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE title = $1 AND source = $2 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(title)
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_event).transpose()?)
    }

    async fn insert_event(&self, candidate: &EventCandidate) -> Result<StoredEvent, StoreError> {
        let stored = StoredEvent::from_candidate(candidate.clone(), Utc::now());
        let event = &stored.event;
        let inserted = sqlx::query(
            r#"
            INSERT INTO events (
                id, title, organizer, date, location, event_type, image_url, is_virtual,
                description, registration_deadline, registration_url, skills, eligibility,
                prizes, source, status, created_at, created_by, is_featured
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (title, source) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(stored.id)
        .bind(&event.title)
        .bind(&event.organizer)
        .bind(&event.date)
        .bind(&event.location)
        .bind(&event.event_type)
        .bind(&event.image_url)
        .bind(event.is_virtual)
        .bind(&event.description)
        .bind(&event.registration_deadline)
        .bind(&event.registration_url)
        .bind(&event.skills)
        .bind(&event.eligibility)
        .bind(&event.prizes)
        .bind(&event.source)
        .bind(event.status.map(|s| s.as_str()))
        .bind(stored.created_at)
        .bind(stored.created_by)
        .bind(stored.is_featured)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(stored),
            None => Err(StoreError::Conflict {
                title: event.title.clone(),
                source_name: event.source.clone(),
            }),
        }
    }

    async fn count_events(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM scraper_sources ORDER BY name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_source).collect::<Result<Vec<_>, _>>()?)
    }

    async fn count_sources(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scraper_sources")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn insert_many_sources(&self, sources: &[Source]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for source in sources {
            sqlx::query(
                r#"
                INSERT INTO scraper_sources (name, url, logo, is_enabled, last_scraped)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(&source.name)
            .bind(&source.url)
            .bind(&source.logo)
            .bind(source.is_enabled)
            .bind(source.last_scraped)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM scraper_sources WHERE name = $1");
        let row = sqlx::query(&sql).bind(name).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_source).transpose()?)
    }

    async fn update_source_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Option<Source>, StoreError> {
        let sql = format!(
            "UPDATE scraper_sources SET is_enabled = $2 WHERE name = $1 RETURNING {SOURCE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_source).transpose()?)
    }

    async fn mark_source_scraped(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE scraper_sources SET last_scraped = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
