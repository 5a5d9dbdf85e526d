//! JSON HTTP surface for triggering crawls and managing scraper sources.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use eventhive_core::EventCandidate;
use eventhive_sync::{maybe_build_scheduler, orchestrator_from_config, CrawlError, Orchestrator, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "eventhive-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleBody {
    is_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeSourceResponse {
    message: String,
    inserted_count: usize,
    events: Vec<EventCandidate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeAllResponse {
    message: String,
    error_sources: Option<Vec<String>>,
    events_count: usize,
    inserted_count: usize,
    run_id: String,
}

pub fn app(state: AppState) -> Router {
    let scrapers = Router::new()
        .route("/sources", get(sources_handler))
        .route("/sources/{name}", put(toggle_source_handler))
        .route("/scrape/{source}", post(scrape_source_handler))
        .route("/scrape-all", post(scrape_all_handler));
    Router::new()
        .nest("/api/scrapers", scrapers)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "http surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let orchestrator = Arc::new(orchestrator_from_config(&config).await?);
    let scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.crawl_cron, "crawl scheduler started");
    }
    serve(AppState::new(orchestrator), config.web_port).await
}

async fn sources_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.registry().list_all().await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => {
            error!(error = %err, "listing scraper sources failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Error fetching scraper sources")
        }
    }
}

async fn toggle_source_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ToggleBody>,
) -> Response {
    match state.orchestrator.registry().toggle(&name, body.is_enabled).await {
        Ok(source) => Json(source).into_response(),
        Err(CrawlError::NotFound(_)) => message(StatusCode::NOT_FOUND, "Scraper source not found"),
        Err(err) => {
            error!(source = %name, error = %err, "toggling scraper source failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Error updating scraper source")
        }
    }
}

async fn scrape_source_handler(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Response {
    match state.orchestrator.run_one(&source).await {
        Ok(run) => Json(ScrapeSourceResponse {
            message: format!("Successfully scraped {} events from {}", run.events_scraped, source),
            inserted_count: run.inserted_count,
            events: run.events,
        })
        .into_response(),
        Err(err) => match err.cause {
            CrawlError::NotFound(_) => message(StatusCode::NOT_FOUND, "Scraper source not found"),
            CrawlError::SourceDisabled(_) => {
                message(StatusCode::BAD_REQUEST, "This scraper source is disabled")
            }
            _ => {
                error!(source = %source, stage = %err.stage, error = %err.cause, "scrape failed");
                message(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Error scraping {source}"),
                )
            }
        },
    }
}

async fn scrape_all_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.run_all().await {
        Ok(summary) => {
            let error_sources = if summary.failed_sources.is_empty() {
                None
            } else {
                Some(summary.failed_sources.clone())
            };
            Json(ScrapeAllResponse {
                message: format!(
                    "Scraped {} events from {} sources",
                    summary.events_count,
                    summary.succeeded_sources.len()
                ),
                error_sources,
                events_count: summary.events_count,
                inserted_count: summary.total_inserted,
                run_id: summary.run_id.to_string(),
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "scrape-all could not list sources");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Error scraping all sources")
        }
    }
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}
