use std::collections::BTreeMap;

use amiibo_adapters::CatalogProvider;
use amiibo_sync::{ScrapeStatus, TrackerConfig};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "amiibo-cli")]
#[command(about = "Amiibo collection tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web tracker.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Scrape the Nintendo line-up into the local snapshot.
    Scrape {
        /// Ignore the staleness guard.
        #[arg(long)]
        force: bool,
        /// Fill new placeholders from the remote catalog.
        #[arg(long)]
        auto_backfill: bool,
        #[arg(long)]
        min_similarity: Option<f64>,
    },
    /// Print per-series counts of the current catalog.
    Catalog {
        #[arg(long)]
        all_types: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amiibo=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = TrackerConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.web_port = port;
            }
            amiibo_web::serve(config).await?;
        }
        Commands::Scrape {
            force,
            auto_backfill,
            min_similarity,
        } => {
            config.auto_backfill |= auto_backfill;
            if let Some(min_similarity) = min_similarity {
                config.min_similarity = min_similarity.clamp(0.0, 1.0);
            }
            let job = config.backfill_job(config.http_fetcher()?);
            let outcome = job.run(force).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.status == ScrapeStatus::Error {
                tracing::warn!("scrape finished with an error outcome");
            }
        }
        Commands::Catalog { all_types } => {
            config.include_all_types |= all_types;
            let source = config.catalog_source(config.http_fetcher()?);
            let records = source.fetch_catalog().await?;
            let mut per_series: BTreeMap<&str, usize> = BTreeMap::new();
            for record in &records {
                *per_series.entry(record.series.as_str()).or_default() += 1;
            }
            for (series, count) in &per_series {
                println!("{count:>5}  {series}");
            }
            println!(
                "catalog: {} amiibo across {} series ({} upcoming)",
                records.len(),
                per_series.len(),
                records.iter().filter(|r| r.is_upcoming).count()
            );
        }
    }

    Ok(())
}
