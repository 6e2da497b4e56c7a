//! Database statistics and health overview.
//!
//! Summarises what has been captured and ingested: feed counts, items per
//! status, highlights, and embedding coverage, with a per-feed breakdown.
//! Used by `cap stats` to confirm that polling and indexing are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::ItemStatus;
use crate::store::{SqliteStore, Store};

struct FeedStats {
    label: String,
    active: bool,
    item_count: i64,
    failed_count: i64,
    last_item_ms: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let total_feeds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feeds")
        .fetch_one(&pool)
        .await?;
    let active_feeds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feeds WHERE active = 1")
        .fetch_one(&pool)
        .await?;
    let total_sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
        .fetch_one(&pool)
        .await?;
    let total_highlights: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM highlights")
        .fetch_one(&pool)
        .await?;
    let by_status = store.count_items_by_status().await?;
    let total_items: i64 = by_status.iter().map(|(_, n)| n).sum();
    let total_embedded = store.count_embeddings().await?;

    let embeddable = total_highlights
        + by_status
            .iter()
            .filter(|(s, _)| matches!(s, ItemStatus::Processed | ItemStatus::Indexed))
            .map(|(_, n)| n)
            .sum::<i64>();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Capture Harness — Database Stats");
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Feeds:       {} ({} active)", total_feeds, active_feeds);
    println!("  Items:       {}", total_items);
    for (status, n) in &by_status {
        println!("    {:<10} {}", status.as_str(), n);
    }
    println!("  Sources:     {}", total_sources);
    println!("  Highlights:  {}", total_highlights);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        embeddable,
        if embeddable > 0 {
            (total_embedded * 100) / embeddable
        } else {
            0
        }
    );

    let feed_rows = sqlx::query(
        r#"
        SELECT
            f.url, f.title, f.active,
            COUNT(i.id) AS item_count,
            COALESCE(SUM(CASE WHEN i.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count,
            MAX(i.created_at) AS last_item
        FROM feeds f
        LEFT JOIN items i ON i.feed_id = f.id
        GROUP BY f.id
        ORDER BY item_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut feed_stats = Vec::with_capacity(feed_rows.len());
    for row in &feed_rows {
        let title: Option<String> = row.try_get("title")?;
        let url: String = row.try_get("url")?;
        feed_stats.push(FeedStats {
            label: title.unwrap_or(url),
            active: row.try_get::<i64, _>("active")? != 0,
            item_count: row.try_get("item_count")?,
            failed_count: row.try_get("failed_count")?,
            last_item_ms: row.try_get("last_item")?,
        });
    }

    if !feed_stats.is_empty() {
        println!();
        println!("  By feed:");
        println!(
            "  {:<32} {:>8} {:>6} {:>6}   {}",
            "FEED", "STATUS", "ITEMS", "FAILED", "LAST ITEM"
        );
        println!("  {}", "-".repeat(76));

        for f in &feed_stats {
            let last = match f.last_item_ms {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            println!(
                "  {:<32} {:>8} {:>6} {:>6}   {}",
                clip(&f.label, 32),
                if f.active { "active" } else { "paused" },
                f.item_count,
                f.failed_count,
                last
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for a Unix timestamp in seconds, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let (n, unit) = match delta {
        d if d < 60 => return "just now".to_string(),
        d if d < 3600 => (d / 60, "min"),
        d if d < 86400 => (d / 3600, "hour"),
        d if d < 86400 * 30 => (d / 86400, "day"),
        _ => return format_ts_iso(ts),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
