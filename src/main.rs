//! # Capture Harness CLI (`cap`)
//!
//! Command-line interface for the capture and feed-ingestion backend.
//!
//! ## Usage
//!
//! ```bash
//! cap --config ./config/cap.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cap init` | Create the SQLite database and schema |
//! | `cap feed add <url>` | Subscribe to a feed |
//! | `cap feed list` | List subscribed feeds |
//! | `cap feed activate <id>` / `deactivate <id>` | Toggle polling for a feed |
//! | `cap capture` | Store a source and a highlight of it |
//! | `cap sync [feed-id]` | Ingest one feed, or every active feed |
//! | `cap watch` | Poll active feeds on an interval |
//! | `cap index` | Embed processed content and mark items indexed |
//! | `cap search "<query>"` | Hybrid search over highlights and items |
//! | `cap stats` | Database overview |
//! | `cap serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `capture_harness=info`);
//! command output goes to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use capture_harness::config;
use capture_harness::feeds::{self, CaptureRequest};
use capture_harness::models::Corpus;
use capture_harness::{index, ingest, migrate, scheduler, search, server, stats};

#[derive(Parser)]
#[command(
    name = "cap",
    about = "Capture Harness — highlights, feeds, and hybrid search in one SQLite file",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage feed subscriptions.
    Feed {
        #[command(subcommand)]
        action: FeedAction,
    },

    /// Store a source document with one highlight.
    Capture {
        /// The highlighted text.
        #[arg(long)]
        text: String,

        /// Free-form note attached to the highlight.
        #[arg(long)]
        note: Option<String>,

        /// Source title.
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        author: Option<String>,

        /// Where the source came from, usually a URL.
        #[arg(long)]
        origin: Option<String>,

        /// Source type: web, pdf, book, ...
        #[arg(long, default_value = "web")]
        kind: String,

        /// Path to a file holding the full source text.
        #[arg(long)]
        raw_file: Option<PathBuf>,
    },

    /// Ingest feeds once.
    Sync {
        /// Feed id. Omit to ingest every active feed.
        feed_id: Option<String>,
    },

    /// Poll active feeds until interrupted.
    Watch,

    /// Embed pending highlights and processed items.
    Index {
        /// Maximum number of entities to embed in this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search highlights and feed items.
    Search {
        /// Query text. Empty lists the most recent entries.
        #[arg(default_value = "")]
        query: String,

        /// Require this tag (repeatable). Switches to tag search.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Which collections to search: all, highlights, items.
        #[arg(long, default_value = "all")]
        corpus: Corpus,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show database statistics.
    Stats,

    /// Start the HTTP server.
    Serve,
}

#[derive(Subcommand)]
enum FeedAction {
    /// Subscribe to a feed URL.
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// List feeds.
    List {
        /// Only show feeds that are polled.
        #[arg(long)]
        active: bool,
    },
    /// Resume polling a feed.
    Activate { id: String },
    /// Stop polling a feed. Its items stay searchable.
    Deactivate { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capture_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Feed { action } => match action {
            FeedAction::Add { url, title } => {
                feeds::run_feed_add(&cfg, &url, title.as_deref()).await?;
            }
            FeedAction::List { active } => {
                feeds::run_feed_list(&cfg, active).await?;
            }
            FeedAction::Activate { id } => {
                feeds::run_feed_set_active(&cfg, &id, true).await?;
            }
            FeedAction::Deactivate { id } => {
                feeds::run_feed_set_active(&cfg, &id, false).await?;
            }
        },
        Commands::Capture {
            text,
            note,
            title,
            author,
            origin,
            kind,
            raw_file,
        } => {
            let raw_text = match raw_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => None,
            };
            let request = CaptureRequest {
                kind,
                origin,
                title,
                author,
                raw_text,
                highlight: text,
                note,
            };
            feeds::run_capture(&cfg, request).await?;
        }
        Commands::Sync { feed_id } => {
            ingest::run_sync(&cfg, feed_id.as_deref()).await?;
        }
        Commands::Watch => {
            scheduler::run_watch(&cfg).await?;
        }
        Commands::Index { limit } => {
            index::run_index(&cfg, limit).await?;
        }
        Commands::Search {
            query,
            tags,
            corpus,
            limit,
        } => {
            search::run_search(&cfg, &query, tags, corpus, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
