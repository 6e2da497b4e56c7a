use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            title TEXT,
            etag TEXT,
            last_modified TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // (feed_id, dedup_key) is the only guard against duplicate ingestion
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            feed_id TEXT NOT NULL,
            dedup_key TEXT NOT NULL,
            link TEXT,
            title TEXT,
            author TEXT,
            published_at INTEGER,
            content_text TEXT NOT NULL DEFAULT '',
            summary TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            raw_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'new',
            enrich_attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(feed_id, dedup_key),
            FOREIGN KEY (feed_id) REFERENCES feeds(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            origin TEXT,
            title TEXT,
            author TEXT,
            raw_text TEXT,
            summary TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS highlights (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            text TEXT NOT NULL,
            note TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (entity_kind, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent, so check first
    for (table, key_column) in [("items_fts", "item_id"), ("highlights_fts", "highlight_id")] {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            sqlx::query(&format!(
                "CREATE VIRTUAL TABLE {} USING fts5({} UNINDEXED, body)",
                table, key_column
            ))
            .execute(pool)
            .await?;
        }
    }

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_items_published_at ON items(published_at)",
        "CREATE INDEX IF NOT EXISTS idx_items_status ON items(status)",
        "CREATE INDEX IF NOT EXISTS idx_items_created_at ON items(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_highlights_created_at ON highlights(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_highlights_source_id ON highlights(source_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
