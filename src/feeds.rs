//! Feed subscriptions and manual capture.
//!
//! Thin commands over [`Store`]: subscribe, list, (de)activate feeds, and
//! record a source document together with one highlight of it.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::models::{now_millis, Feed, Highlight, Source};
use crate::store::{SqliteStore, Store};

/// Subscribe to a feed. Only `http` and `https` URLs are accepted.
pub async fn add_feed(store: &dyn Store, url: &str, title: Option<&str>) -> Result<Feed> {
    let parsed = url::Url::parse(url.trim()).with_context(|| format!("Invalid feed URL: {}", url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Feed URL must be http or https: {}", url);
    }
    let feed = store.create_feed(parsed.as_str(), title).await?;
    info!(feed_id = %feed.id, url = %feed.url, "feed added");
    Ok(feed)
}

/// Input of [`capture`].
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub kind: String,
    pub origin: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub raw_text: Option<String>,
    pub highlight: String,
    pub note: Option<String>,
}

/// Store a new source and one highlight of it.
pub async fn capture(store: &dyn Store, request: CaptureRequest) -> Result<(Source, Highlight)> {
    if request.highlight.trim().is_empty() {
        bail!("highlight text must not be empty");
    }
    let now = now_millis();
    let source = Source {
        id: uuid::Uuid::new_v4().to_string(),
        kind: if request.kind.trim().is_empty() {
            "web".to_string()
        } else {
            request.kind
        },
        origin: request.origin,
        title: request.title,
        author: request.author,
        raw_text: request.raw_text,
        summary: None,
        created_at: now,
    };
    store.insert_source(&source).await?;

    let highlight = Highlight {
        id: uuid::Uuid::new_v4().to_string(),
        source_id: source.id.clone(),
        text: request.highlight,
        note: request.note.filter(|n| !n.trim().is_empty()),
        created_at: now,
    };
    store.insert_highlight(&highlight).await?;

    Ok((source, highlight))
}

async fn open_store(config: &Config) -> Result<(sqlx::SqlitePool, Arc<dyn Store>)> {
    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    Ok((pool, store))
}

/// `cap feed add`
pub async fn run_feed_add(config: &Config, url: &str, title: Option<&str>) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    let feed = add_feed(store.as_ref(), url, title).await?;
    println!("Added feed {}", feed.id);
    println!("  url: {}", feed.url);
    pool.close().await;
    Ok(())
}

/// `cap feed list`
pub async fn run_feed_list(config: &Config, active_only: bool) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    let feeds = store.list_feeds(active_only).await?;

    if feeds.is_empty() {
        println!("No feeds.");
    } else {
        println!("{:<36}  {:<8}  {:<24}  URL", "ID", "STATUS", "TITLE");
        for feed in &feeds {
            println!(
                "{:<36}  {:<8}  {:<24}  {}",
                feed.id,
                if feed.active { "active" } else { "inactive" },
                truncate(feed.title.as_deref().unwrap_or("-"), 24),
                feed.url
            );
        }
    }

    pool.close().await;
    Ok(())
}

/// `cap feed activate` / `cap feed deactivate`
pub async fn run_feed_set_active(config: &Config, id: &str, active: bool) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    if !store.set_feed_active(id, active).await? {
        pool.close().await;
        bail!("Feed not found: {}", id);
    }
    println!(
        "Feed {} {}",
        id,
        if active { "activated" } else { "deactivated" }
    );
    pool.close().await;
    Ok(())
}

/// `cap capture`
pub async fn run_capture(config: &Config, request: CaptureRequest) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    let (source, highlight) = capture(store.as_ref(), request).await?;
    println!("Captured highlight {}", highlight.id);
    println!("  source: {}", source.id);
    pool.close().await;
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}
