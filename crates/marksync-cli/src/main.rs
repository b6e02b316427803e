use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marksync_storage::SqliteItemStore;
use marksync_sync::{export_items, FailurePolicy, SyncConfig, SyncPipeline};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "marksync")]
#[command(about = "Sync bookmark trees and reading lists into SQLite")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides MARKSYNC_WORKSPACE_ROOT.
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every enabled source into the database.
    Sync {
        /// Run against an in-memory copy of the stored rows and report what would change.
        #[arg(long)]
        dry_run: bool,

        /// skip-subtree or abort-root.
        #[arg(long)]
        failure_policy: Option<FailurePolicy>,

        #[arg(long)]
        no_reports: bool,

        /// Print the full summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the database and apply migrations.
    Migrate,
    /// Write stored rows and a checksummed manifest to a directory.
    Export {
        #[arg(long, default_value = "export")]
        out: PathBuf,

        /// Root labels to export; all stored sources when omitted.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Show one source after allow-list filtering, without touching the database.
    Inspect { source_id: String },
    /// Per-source item counts and last sync time.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
    }

    let command = cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        failure_policy: None,
        no_reports: false,
        json: false,
    });

    match command {
        Commands::Sync {
            dry_run,
            failure_policy,
            no_reports,
            json,
        } => {
            config.dry_run = dry_run;
            if let Some(policy) = failure_policy {
                config.failure_policy = policy;
            }
            if no_reports {
                config.write_reports = false;
            }
            let summary = SyncPipeline::new(config).run_once().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing summary")?
                );
            } else {
                for scope in &summary.scopes {
                    let s = scope.stats;
                    println!(
                        "{}: inserted={} updated={} deleted={} unchanged={} skipped={} failed={} malformed={} issues={}",
                        scope.scope,
                        s.inserted,
                        s.updated,
                        s.deleted,
                        s.unchanged,
                        s.skipped,
                        s.failed,
                        s.malformed,
                        scope.issues.len()
                    );
                }
                println!(
                    "sync {}: run_id={} sources={} reports={}",
                    if summary.dry_run { "preview" } else { "complete" },
                    summary.run_id,
                    summary.enabled_sources,
                    summary.reports_dir.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Migrate => {
            SqliteItemStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Export { out, sources } => {
            let mut store = SqliteItemStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            let out = config.resolve(&out);
            let manifest = export_items(&mut store, &sources, &out).await?;
            println!(
                "exported {} items from {} source(s) to {}",
                manifest.item_count,
                manifest.sources.len(),
                out.display()
            );
        }
        Commands::Inspect { source_id } => {
            let inspection = SyncPipeline::new(config).inspect_source(&source_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&inspection).context("serializing inspection")?
            );
        }
        Commands::Stats { json } => {
            let mut store = SqliteItemStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            let stats = store.source_stats().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats).context("serializing stats")?
                );
            } else if stats.is_empty() {
                println!("no rows in {}", config.database_url);
            } else {
                for row in &stats {
                    println!(
                        "{}: items={} links={} folders={} last_synced={}",
                        row.source,
                        row.items,
                        row.links,
                        row.folders,
                        row.last_synced.to_rfc3339()
                    );
                }
            }
        }
    }

    Ok(())
}
