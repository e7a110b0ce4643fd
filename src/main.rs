//! # Memory Index CLI (`memx`)
//!
//! Indexes the configured memory directories and answers hybrid queries
//! against them.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memx init` | Create the SQLite database and probe capabilities |
//! | `memx sync [scope]` | Index every source, or one scope |
//! | `memx search "<query>"` | Hybrid (or keyword-only) search |
//! | `memx status` | Counts, capabilities and last sync per scope |
//! | `memx watch` | Sync, then re-sync scopes as their files change |
//!
//! ## Examples
//!
//! ```bash
//! memx --config ./config/memx.toml init
//! memx sync agent
//! memx search "postgres migration" --limit 3 --source user
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use memory_index::config::load_config;
use memory_index::manager::{IndexManager, SyncReport};
use memory_index::models::{SearchOptions, Source};
use memory_index::stats;

/// Memory Index: local hybrid search over markdown memory files.
#[derive(Parser)]
#[command(
    name = "memx",
    about = "Local hybrid (vector + keyword) search over markdown memory files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memx.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and report which indexes are available.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Bring the index up to date with the source directories.
    ///
    /// Unchanged files are skipped by content hash. Ctrl-C cancels
    /// in-flight embedding calls; files indexed before that stay indexed.
    Sync {
        /// Scope name of a single source; all sources when omitted.
        scope: Option<String>,
    },

    /// Search the index.
    Search {
        query: String,

        /// Maximum number of results (defaults to `retrieval.max_results`).
        #[arg(long)]
        limit: Option<usize>,

        /// Only return chunks from this source kind (`user`, `agent`, `workspace`).
        #[arg(long)]
        source: Option<Source>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index counts, capabilities and last sync per scope.
    Status,

    /// Sync once, then watch every source and re-sync on change until Ctrl-C.
    Watch,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// A token cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}

fn print_report(report: &SyncReport) {
    println!(
        "Indexed {} file(s), {} unchanged, {} removed; {} chunk(s) written.",
        report.files_indexed, report.files_unchanged, report.files_removed, report.chunks_written
    );
    println!(
        "Embeddings: {} cached, {} computed.",
        report.embeddings_cached, report.embeddings_computed
    );
    if report.cache_evicted > 0 {
        println!("Evicted {} cache entr(ies).", report.cache_evicted);
    }
    if report.errors > 0 {
        println!("{} file(s) skipped with errors; see log.", report.errors);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let manager = IndexManager::open(cfg).await?;
            let vector = manager.vector_status();
            println!("Database initialized at {}.", manager.config().db.path.display());
            println!(
                "  keyword index: {}",
                if manager.store().is_keyword_index_available() {
                    "fts5"
                } else {
                    "substring scan"
                }
            );
            match vector.reason {
                None => println!("  vector index:  sqlite-vec"),
                Some(reason) => println!("  vector index:  in-process ({})", reason),
            }
            manager.close().await;
        }
        Commands::Sync { scope } => {
            let manager = IndexManager::open(cfg).await?;
            let cancel = ctrl_c_token();
            let result = match scope {
                Some(scope) => manager.sync_scope(&scope, &cancel).await,
                None => manager.sync(&cancel).await,
            };
            manager.close().await;
            print_report(&result?);
        }
        Commands::Search {
            query,
            limit,
            source,
            json,
        } => {
            let manager = IndexManager::open(cfg).await?;
            let options = SearchOptions {
                limit,
                source_filter: source,
            };
            let results = manager.search(&query, options).await;
            manager.close().await;
            let results = results?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {}:{}-{} ({})",
                        i + 1,
                        r.score,
                        r.path,
                        r.start_line,
                        r.end_line,
                        r.source
                    );
                    println!("    \"{}\"", r.snippet.replace('\n', " ").trim());
                    println!();
                }
            }
        }
        Commands::Status => {
            let manager = IndexManager::open(cfg).await?;
            let result = stats::run_status(&manager).await;
            manager.close().await;
            result?;
        }
        Commands::Watch => {
            let manager = Arc::new(IndexManager::open(cfg).await?);
            let report = manager.sync(&ctrl_c_token()).await?;
            print_report(&report);

            manager.spawn_auto_sync()?;
            info!("watching for changes, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            manager.close().await;
        }
    }

    Ok(())
}
