use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use traffic_core::{lookup_selector, RecordKind, SelectorLookup, Table};
use traffic_sync::{IngestPipeline, PresenceReloader, ReloadOutcome, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "traffic-cli")]
#[command(about = "Traffic data ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the source directory and replace persisted collections.
    Ingest,
    /// Reload everything if the collection is missing from both databases.
    Ensure { collection: String },
    /// Print a selector's collection for one year, sorted by its key.
    Show {
        category: String,
        year: i32,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the first documents of a collection.
    Preview {
        database: String,
        collection: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Drop every managed database.
    DropAll,
}

fn print_rows(table: &Table, limit: usize) -> Result<()> {
    for doc in table.to_documents().into_iter().take(limit) {
        println!("{}", serde_json::to_string(&doc).context("serializing row")?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = IngestPipeline::from_config(&config)?.run_once().await?;
            println!(
                "ingest complete: run_id={} sources={} skipped={} volume_rows={} \
                 incident_rows={} collections={} pruned={}",
                summary.run_id,
                summary.sources.len(),
                summary.skipped.len(),
                summary.volume_rows,
                summary.incident_rows,
                summary.collections.len(),
                summary.pruned.len()
            );
        }
        Commands::Ensure { collection } => {
            let outcome = PresenceReloader::from_config(&config)?.ensure(&collection).await?;
            let status = match outcome {
                ReloadOutcome::Present => "present",
                ReloadOutcome::Reloaded(_) => "reloaded",
                ReloadOutcome::ReloadedKnownAbsent(_) => "reloaded; marked known-absent",
            };
            println!("{collection}: {status}");
        }
        Commands::Show {
            category,
            year,
            limit,
        } => {
            let target = match lookup_selector(&category, year) {
                SelectorLookup::Mapped(target) => target,
                SelectorLookup::Unmapped => bail!("{category}/{year} has no collection assigned"),
                SelectorLookup::Unknown => bail!("unknown selector {category}/{year}"),
            };
            let Some(kind) = RecordKind::from_selector_category(&category) else {
                bail!("unknown selector category {category}");
            };
            let table = PresenceReloader::from_config(&config)?
                .fetch_year_sorted(&target, kind, i64::from(year))
                .await?;
            println!("{} rows in {}.{}", table.len(), target.database, target.collection);
            print_rows(&table, limit)?;
        }
        Commands::Preview {
            database,
            collection,
            limit,
        } => {
            let table = config.open_store().preview(&database, &collection, limit).await?;
            print_rows(&table, limit)?;
        }
        Commands::DropAll => {
            let dropped = config.open_store().drop_all_managed().await?;
            println!("dropped: {}", dropped.join(", "));
        }
    }

    Ok(())
}
