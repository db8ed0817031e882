use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use ppb_digest::{stats_ladder, DeliveryError, DigestMessage, Messenger};
use ppb_store::pg::PgStore;
use ppb_sync::BulletinConfig;

#[derive(Debug, Parser)]
#[command(name = "ppb-cli")]
#[command(about = "Procurement Price Bulletin command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the refreshed sheets into the canonical store.
    Sync,
    /// Run one digest dispatch pass.
    Digest,
    /// Print the stats ladder for a region and product category.
    Stats { region: String, category: String },
    /// Apply database migrations and exit.
    Migrate,
}

/// Stands in for the messaging transport when digests are run by hand.
struct ConsoleMessenger;

#[async_trait]
impl Messenger for ConsoleMessenger {
    async fn send(&self, recipient: &str, message: &DigestMessage) -> Result<(), DeliveryError> {
        println!("-> {recipient}\n{}\n", message.text);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = ppb_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sheets={}+{} inserted={} updated={} skipped={}",
                summary.run_id,
                summary.sheets_accepted,
                summary.sheets_rejected,
                summary.inserted,
                summary.updated,
                summary.skipped
            );
        }
        Commands::Digest => {
            let summary = ppb_sync::run_digest_once_from_env(Arc::new(ConsoleMessenger)).await?;
            println!(
                "digest complete: run_id={} date={} sent={:?} no_data={} failed={}",
                summary.run_id, summary.date, summary.sent, summary.no_data, summary.failed
            );
        }
        Commands::Stats { region, category } => {
            let region = ppb_core::Region::parse(&region)
                .ok_or_else(|| anyhow!("unknown region {region:?}"))?;
            let category = ppb_core::Category::parse(&category)
                .ok_or_else(|| anyhow!("unknown product category {category:?}"))?;

            let config = BulletinConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            match stats_ladder(&store, &region, &category, Utc::now()).await? {
                Some(ladder) => {
                    for window in ladder {
                        println!(
                            "{}: count={} total={} min={} max={} avg={}",
                            window.label,
                            window.stats.count,
                            window.stats.total,
                            window.stats.min,
                            window.stats.max,
                            window.stats.avg
                        );
                    }
                }
                None => println!(
                    "no procurements recorded for {} in {}",
                    category.as_str(),
                    region.as_str()
                ),
            }
        }
        Commands::Migrate => {
            let config = BulletinConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
