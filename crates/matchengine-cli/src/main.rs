use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use matchengine_core::TenantScope;
use matchengine_pipeline::{
    collect_stats, run_standalone, Collaborators, Orchestrator, PipelineConfig, SearchFile, Stage,
    StageRunner, Stores, WebhookDispatcher,
};
use matchengine_storage::{JobStore, MemoryStore, PgStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchengine")]
#[command(about = "MatchEngine ingestion pipeline")]
struct Cli {
    /// Use the in-memory store instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,

    /// Search file with the global query list (defaults to MATCHENGINE_SEARCH_FILE).
    #[arg(long, global = true)]
    search_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Global search, classify and extract once, then print statistics.
    Run,
    /// Run the per-configuration scheduler until interrupted.
    Orchestrate,
    /// Run one global stage.
    Stage { stage: Stage },
    /// Move failed extractions back to the classified queue.
    RequeueFailed,
    Stats,
    Migrate,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("MATCHENGINE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_stores(memory: bool, config: &PipelineConfig) -> Result<Stores> {
    if memory {
        warn!("using in-memory store; nothing will be persisted");
        return Ok(Stores::shared(Arc::new(MemoryStore::new())));
    }
    let store = connect_postgres(config).await?;
    Ok(Stores::shared(Arc::new(store)))
}

async fn connect_postgres(config: &PipelineConfig) -> Result<PgStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set (pass --memory for a throwaway store)")?;
    PgStore::connect(url)
        .await
        .context("connecting to postgres")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(path) = cli.search_file {
        config.search_file = path;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            if cli.memory {
                info!("in-memory store needs no migrations");
                return Ok(());
            }
            connect_postgres(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Run => {
            let stores = open_stores(cli.memory, &config).await?;
            let collaborators = Collaborators::from_config(&config)?;
            let runner = StageRunner::new(&stores, &collaborators);
            let search = SearchFile::load(&config.search_file).await?;
            let report = run_standalone(&runner, &stores, &search, &config).await?;
            print_json(&report)?;
        }
        Commands::Stage { stage } => {
            let stores = open_stores(cli.memory, &config).await?;
            let collaborators = Collaborators::from_config(&config)?;
            let runner = StageRunner::new(&stores, &collaborators);
            let report = runner.run_global(stage, None, &config).await?;
            print_json(&report)?;
        }
        Commands::Orchestrate => {
            let stores = open_stores(cli.memory, &config).await?;
            let collaborators = Collaborators::from_config(&config)?;
            let dispatcher = WebhookDispatcher::new(stores.webhooks.clone())
                .context("building webhook client")?;
            let orchestrator = Orchestrator::new(
                stores,
                &collaborators,
                dispatcher,
                config.orchestrator_settings(),
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, finishing current tick");
                    let _ = shutdown_tx.send(true);
                }
            });
            orchestrator.run(shutdown_rx).await;
        }
        Commands::RequeueFailed => {
            let stores = open_stores(cli.memory, &config).await?;
            let moved = stores
                .jobs
                .requeue_failed_extractions(&TenantScope::global())
                .await?;
            println!("requeued {moved} failed extractions");
        }
        Commands::Stats => {
            let stores = open_stores(cli.memory, &config).await?;
            print_json(&collect_stats(&stores).await?)?;
        }
        Commands::Serve { port } => {
            let stores = open_stores(cli.memory, &config).await?;
            let collaborators = Collaborators::from_config(&config)?;
            let runner = StageRunner::new(&stores, &collaborators);
            let port = port.unwrap_or(config.web_port);
            matchengine_web::serve(matchengine_web::AppState::new(stores, runner, config), port)
                .await?;
        }
    }

    Ok(())
}
