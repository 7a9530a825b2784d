use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use envhealth_storage::Store;
use envhealth_sync::SyncConfig;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "envhealth-cli")]
#[command(about = "Environmental and health data ingestion")]
struct Cli {
    /// SQLite database file (overrides ENVHEALTH_DB).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Region registry file (overrides ENVHEALTH_REGIONS).
    #[arg(long, global = true)]
    regions: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every configured source.
    Sync,
    /// Bring the database schema up to date without ingesting anything.
    Migrate,
    /// Print row counts per table.
    Counts,
    /// Print stored rows joined with their region.
    Show {
        #[arg(value_enum)]
        table: Table,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Write parquet snapshots of every table plus a checksum manifest.
    Export {
        #[arg(long, default_value = "./reports/export")]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Table {
    Regions,
    AirQuality,
    Weather,
    Health,
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(db) = &self.db {
            config.database_path = db.clone();
        }
        if let Some(regions) = &self.regions {
            config.regions_file = regions.clone();
        }
        config
    }
}

async fn open_migrated(config: &SyncConfig) -> Result<Store> {
    let store = Store::open(&config.database_path)
        .await
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let report = store.ensure_schema().await.context("migrating schema")?;
    if !report.applied.is_empty() {
        info!(
            version = report.version,
            applied = report.applied.len(),
            destructive = report.destructive_changes(),
            "schema migrated"
        );
    }
    Ok(store)
}

fn print_rows<T: Serialize>(rows: &[T]) -> Result<()> {
    for row in rows {
        println!("{}", serde_json::to_string(row).context("serializing row")?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = envhealth_sync::run_sync_once(config).await?;
            println!("{}", summary.render_text());
        }
        Commands::Migrate => {
            let store = Store::open(&config.database_path)
                .await
                .with_context(|| format!("opening {}", config.database_path.display()))?;
            let report = store.ensure_schema().await.context("migrating schema")?;
            store.close().await;
            for applied in &report.applied {
                println!(
                    "applied v{} {}{}",
                    applied.version,
                    applied.name,
                    if applied.destructive { " (destructive)" } else { "" }
                );
            }
            if !report.adopted.is_empty() {
                println!("adopted legacy migrations {:?}", report.adopted);
            }
            println!("schema at version {}", report.version);
        }
        Commands::Counts => {
            let store = open_migrated(&config).await?;
            let counts = store.table_counts().await;
            store.close().await;
            let counts = counts?;
            println!("regions:        {}", counts.regions);
            println!("air_quality:    {}", counts.air_quality);
            println!("weather:        {}", counts.weather);
            println!("health_records: {}", counts.health_records);
        }
        Commands::Show { table, limit } => {
            let store = open_migrated(&config).await?;
            match table {
                Table::Regions => {
                    let regions = store.list_regions().await?;
                    let shown = regions.len().min(limit as usize);
                    print_rows(&regions[..shown])?;
                }
                Table::AirQuality => print_rows(&store.list_air_quality(Some(limit)).await?)?,
                Table::Weather => print_rows(&store.list_weather(Some(limit)).await?)?,
                Table::Health => print_rows(&store.list_health(Some(limit)).await?)?,
            }
            store.close().await;
        }
        Commands::Export { out } => {
            let store = open_migrated(&config).await?;
            let manifest = envhealth_sync::export_parquet_snapshots(&store, &out).await;
            store.close().await;
            println!("snapshot manifest: {}", manifest?.display());
        }
    }

    Ok(())
}
