use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use eventhive_storage::PgStore;
use eventhive_sync::{orchestrator_from_config, SourceOutcome, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "eventhive")]
#[command(about = "Hackathon event aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl one source, or every enabled source when none is given.
    Crawl { source: Option<String> },
    /// List scraper sources.
    Sources,
    /// Enable or disable a scraper source.
    Toggle {
        name: String,
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    Migrate,
    /// Serve the HTTP API (and the crawl scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,eventhive=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Crawl { source: None }) {
        Commands::Crawl { source: Some(name) } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let run = orchestrator.run_one(&name).await?;
            println!(
                "crawl complete: source={} scraped={} inserted={} skipped={}",
                run.source, run.events_scraped, run.inserted_count, run.skipped_count
            );
        }
        Commands::Crawl { source: None } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let summary = orchestrator.run_all().await?;
            println!(
                "crawl complete: run_id={} scraped={} inserted={} failed={:?}",
                summary.run_id, summary.events_count, summary.total_inserted, summary.failed_sources
            );
            for (name, outcome) in &summary.outcomes {
                match outcome {
                    SourceOutcome::Succeeded { events_scraped, inserted, skipped } => {
                        println!("  {name}: scraped={events_scraped} inserted={inserted} skipped={skipped}")
                    }
                    SourceOutcome::Failed { stage, error } => {
                        println!("  {name}: failed while {stage}: {error}")
                    }
                }
            }
        }
        Commands::Sources => {
            let orchestrator = orchestrator_from_config(&config).await?;
            for source in orchestrator.registry().list_all().await? {
                let last = source
                    .last_scraped
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<12} {:<8} last_scraped={} {}",
                    source.name,
                    if source.is_enabled { "enabled" } else { "disabled" },
                    last,
                    source.url
                );
            }
        }
        Commands::Toggle { name, enabled } => {
            let orchestrator = orchestrator_from_config(&config).await?;
            let source = orchestrator.registry().toggle(&name, enabled).await?;
            println!("{} is_enabled={}", source.name, source.is_enabled);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            eventhive_web::serve_from_env().await?;
        }
    }

    Ok(())
}
