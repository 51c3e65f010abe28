use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tillsync_core::SourceType;
use tillsync_feeds::DateRange;
use tillsync_ingest::{pipeline_from_env, IngestConfig};

#[derive(Debug, Parser)]
#[command(name = "tillsync")]
#[command(about = "Till Sync ingestion service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a feed's pages for a date range and capture them as raw payloads
    Capture {
        #[arg(long)]
        source: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Run one raw payload through transform, commit, and the gate
    Process {
        #[arg(long)]
        raw_id: Uuid,
    },
    /// Process all unprocessed payloads for a scope
    Sweep {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
    /// Start the HTTP trigger endpoint (and the sweep scheduler, if enabled)
    Serve,
    /// Apply pending database migrations
    Migrate,
}

fn parse_source(value: &str) -> Result<SourceType> {
    SourceType::parse(value)
        .with_context(|| format!("unknown source {value}; expected pos-sales or ledger-entries"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capture {
            source,
            owner,
            from,
            to,
        } => {
            let source = parse_source(&source)?;
            let pipeline = pipeline_from_env().await?;
            let summary = pipeline
                .capture(source, &owner, DateRange { from, to })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Process { raw_id } => {
            let pipeline = pipeline_from_env().await?;
            let outcome = pipeline.process_one(raw_id).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Sweep {
            owner,
            source,
            limit,
        } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let pipeline = pipeline_from_env().await?;

            let cancel = pipeline.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received; finishing current sub-batch");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let summary = pipeline.sweep(source, &owner, limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => {
            tillsync_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            let pool = tillsync_storage::connect(&config.database_url).await?;
            tillsync_storage::migrator()
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
