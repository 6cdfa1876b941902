use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tenderwatch_storage::{MemoryTenderStore, PgTenderStore, TenderStore};
use tenderwatch_sync::{build_scheduler, GuardedRunner, Pipeline, PipelineConfig};
use tenderwatch_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tenderwatch")]
#[command(about = "GeM tender discovery and bid document extraction")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for a target date (default: today on the portal).
    Run {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Keep records in memory instead of Postgres.
        #[arg(long)]
        dry_store: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the read-only tender lookup.
    Serve,
    /// Lookup server plus the scheduled pipeline runs.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        date: None,
        dry_store: false,
    }) {
        Commands::Run { date, dry_store } => {
            let store: Arc<dyn TenderStore> = if dry_store {
                Arc::new(MemoryTenderStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let pipeline = Pipeline::from_config(&config, store)?;
            let target_date = date.unwrap_or_else(|| pipeline.portal_date(Utc::now(), 0));
            let summary = pipeline.run_pipeline(target_date).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = Arc::new(connect(&config).await?);
            tenderwatch_web::serve(config.web_port, AppState::new(store)).await?;
        }
        Commands::Daemon => daemon(config).await?,
    }

    Ok(())
}

async fn connect(config: &PipelineConfig) -> Result<PgTenderStore> {
    PgTenderStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

async fn daemon(config: PipelineConfig) -> Result<()> {
    let store = connect(&config).await?;
    store.migrate().await?;
    let store: Arc<dyn TenderStore> = Arc::new(store);

    let pipeline = Arc::new(Pipeline::from_config(&config, store.clone())?);
    let cancel = pipeline.cancel_handle();
    let runner = GuardedRunner::new(pipeline);

    let mut scheduler = build_scheduler(runner, &config).await?;
    match scheduler.as_mut() {
        Some(sched) => sched.start().await.context("starting scheduler")?,
        None => warn!("TENDERWATCH_SCHEDULER_ENABLED is off; serving lookups only"),
    }

    tokio::select! {
        served = tenderwatch_web::serve(config.web_port, AppState::new(store)) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    cancel.store(true, Ordering::SeqCst);
    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
