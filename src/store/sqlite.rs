//! SQLite-backed [`Store`] implementation.
//!
//! Full-text relevance comes from the FTS5 `rank` (bm25) of the
//! `items_fts` / `highlights_fts` tables; vector similarity is a
//! brute-force cosine scan over the `embeddings` table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use super::{EmbedTarget, Store};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    now_millis, Enrichment, Entity, EntityKey, EntityKind, Feed, Highlight, InsertOutcome, Item,
    ItemContent, ItemStatus, NewItem, SearchScope, Source, Validators,
};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const FEED_COLUMNS: &str = "id, url, title, etag, last_modified, active, created_at";

const ITEM_COLUMNS: &str = "id, feed_id, dedup_key, link, title, author, published_at, \
     content_text, summary, tags_json, raw_json, status, enrich_attempts, created_at";

const HIGHLIGHT_COLUMNS: &str = "h.id, h.source_id, h.text, h.note, h.created_at, \
     s.kind AS s_kind, s.origin AS s_origin, s.title AS s_title, s.author AS s_author, \
     s.raw_text AS s_raw_text, s.summary AS s_summary, s.created_at AS s_created_at";

/// Rebuilds the FTS row of one item from its current columns.
const REFRESH_ITEM_FTS: [&str; 2] = [
    "DELETE FROM items_fts WHERE item_id = ?",
    "INSERT INTO items_fts (item_id, body) \
     SELECT id, COALESCE(title, '') || char(10) || content_text || char(10) || COALESCE(summary, '') \
     FROM items WHERE id = ?",
];

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Turn free text into an FTS5 query: every term quoted, implicitly ANDed.
///
/// Returns `None` when nothing searchable is left.
pub(crate) fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Map a bm25 rank (negative, lower is better) into `[0, 1)`.
fn rank_to_relevance(rank: f64) -> f64 {
    let raw = (-rank).max(0.0);
    raw / (1.0 + raw)
}

fn row_to_feed(row: &SqliteRow) -> Result<Feed> {
    Ok(Feed {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<Item> {
    let tags_json: String = row.try_get("tags_json")?;
    let raw_json: String = row.try_get("raw_json")?;
    let status: String = row.try_get("status")?;
    Ok(Item {
        id: row.try_get("id")?,
        feed_id: row.try_get("feed_id")?,
        dedup_key: row.try_get("dedup_key")?,
        link: row.try_get("link")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        published_at: row.try_get("published_at")?,
        content_text: row.try_get("content_text")?,
        summary: row.try_get("summary")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        raw: serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null),
        status: status.parse()?,
        enrich_attempts: row.try_get("enrich_attempts")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_highlight_entity(row: &SqliteRow) -> Result<Entity> {
    let source_id: String = row.try_get("source_id")?;
    Ok(Entity::Highlight {
        highlight: Highlight {
            id: row.try_get("id")?,
            source_id: source_id.clone(),
            text: row.try_get("text")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
        },
        source: Source {
            id: source_id,
            kind: row.try_get("s_kind")?,
            origin: row.try_get("s_origin")?,
            title: row.try_get("s_title")?,
            author: row.try_get("s_author")?,
            raw_text: row.try_get("s_raw_text")?,
            summary: row.try_get("s_summary")?,
            created_at: row.try_get("s_created_at")?,
        },
    })
}

fn sort_newest_first(entities: &mut [Entity]) {
    entities.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
}

fn sort_best_first(scored: &mut [(EntityKey, f64)]) {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

impl SqliteStore {
    async fn fetch_items_where(
        &self,
        clause: &str,
        statuses: &[ItemStatus],
        limit: usize,
    ) -> Result<Vec<Item>> {
        let sql = format!(
            "SELECT {} FROM items WHERE {} AND status IN ({}) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            ITEM_COLUMNS,
            clause,
            placeholders(statuses.len())
        );
        let mut q = sqlx::query(&sql);
        for status in statuses {
            q = q.bind(status.as_str());
        }
        let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn vector_scan(
        &self,
        kind: EntityKind,
        filter_sql: &str,
        statuses: &[ItemStatus],
        query: &[f32],
    ) -> Result<Vec<(EntityKey, f64)>> {
        let sql = format!(
            "SELECT entity_id, vector FROM embeddings WHERE entity_kind = ? {}",
            filter_sql
        );
        let mut q = sqlx::query(&sql).bind(kind.as_str());
        for status in statuses {
            q = q.bind(status.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("entity_id")?;
            let blob: Vec<u8> = row.try_get("vector")?;
            let vector = blob_to_vec(&blob);
            if vector.len() != query.len() {
                continue;
            }
            let score = cosine_similarity(query, &vector) as f64;
            scored.push((EntityKey { kind, id }, score));
        }
        Ok(scored)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_feed(&self, url: &str, title: Option<&str>) -> Result<Feed> {
        let feed = Feed {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            title: title.map(str::to_string),
            etag: None,
            last_modified: None,
            active: true,
            created_at: now_millis(),
        };

        sqlx::query(
            "INSERT INTO feeds (id, url, title, active, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&feed.id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(feed.active)
        .bind(feed.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to add feed {} (already subscribed?)", url))?;

        Ok(feed)
    }

    async fn get_feed(&self, id: &str) -> Result<Option<Feed>> {
        let row = sqlx::query(&format!("SELECT {} FROM feeds WHERE id = ?", FEED_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_feed).transpose()
    }

    async fn list_feeds(&self, active_only: bool) -> Result<Vec<Feed>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM feeds WHERE (? = 0 OR active = 1) ORDER BY created_at ASC",
            FEED_COLUMNS
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_feed).collect()
    }

    async fn set_feed_active(&self, id: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE feeds SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_feed_validators(&self, id: &str, validators: &Validators) -> Result<()> {
        sqlx::query("UPDATE feeds SET etag = ?, last_modified = ? WHERE id = ?")
            .bind(&validators.etag)
            .bind(&validators.last_modified)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn item_exists(&self, feed_id: &str, dedup_key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM items WHERE feed_id = ? AND dedup_key = ?",
        )
        .bind(feed_id)
        .bind(dedup_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_item(&self, item: &NewItem) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, feed_id, dedup_key, link, title, author, published_at,
                               raw_json, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'new', ?)
            ON CONFLICT(feed_id, dedup_key) DO NOTHING
            "#,
        )
        .bind(&item.id)
        .bind(&item.feed_id)
        .bind(&item.dedup_key)
        .bind(&item.link)
        .bind(&item.title)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(item.raw.to_string())
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn complete_item(&self, id: &str, content: &ItemContent) -> Result<bool> {
        let summary = content.enrichment.as_ref().map(|e| e.summary.clone());
        let tags_json = match &content.enrichment {
            Some(e) => Some(serde_json::to_string(&e.tags)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE items SET
                content_text = ?,
                summary = COALESCE(?, summary),
                tags_json = COALESCE(?, tags_json),
                enrich_attempts = enrich_attempts + ?,
                status = 'processed'
            WHERE id = ? AND status = 'new'
            "#,
        )
        .bind(&content.body)
        .bind(summary)
        .bind(tags_json)
        .bind(content.enrichment_attempted as i64)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for stmt in REFRESH_ITEM_FTS {
            sqlx::query(stmt).bind(id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_item_failed(&self, id: &str) -> Result<bool> {
        self.transition_item(id, ItemStatus::New, ItemStatus::Failed)
            .await
    }

    async fn transition_item(&self, id: &str, from: ItemStatus, to: ItemStatus) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query("UPDATE items SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_enrichment(&self, id: &str, enrichment: Option<&Enrichment>) -> Result<()> {
        let summary = enrichment.map(|e| e.summary.clone());
        let tags_json = match enrichment {
            Some(e) => Some(serde_json::to_string(&e.tags)?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE items SET
                summary = COALESCE(?, summary),
                tags_json = COALESCE(?, tags_json),
                enrich_attempts = enrich_attempts + 1
            WHERE id = ?
            "#,
        )
        .bind(summary)
        .bind(tags_json)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if enrichment.is_some() {
            for stmt in REFRESH_ITEM_FTS {
                sqlx::query(stmt).bind(id).execute(&mut *tx).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn items_pending_enrichment(
        &self,
        feed_id: &str,
        max_attempts: i64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM items \
             WHERE feed_id = ? AND status IN ('processed', 'indexed') \
               AND content_text != '' AND summary IS NULL AND enrich_attempts < ? \
             ORDER BY created_at ASC LIMIT ?",
            ITEM_COLUMNS
        ))
        .bind(feed_id)
        .bind(max_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn stalled_items(
        &self,
        feed_id: &str,
        created_before: i64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM items \
             WHERE feed_id = ? AND status = 'new' AND created_at <= ? \
             ORDER BY created_at ASC LIMIT ?",
            ITEM_COLUMNS
        ))
        .bind(feed_id)
        .bind(created_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_items(
        &self,
        feed_id: Option<&str>,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {} FROM items \
             WHERE (? IS NULL OR feed_id = ?) AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            ITEM_COLUMNS
        ))
        .bind(feed_id)
        .bind(feed_id)
        .bind(status)
        .bind(status)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn count_items_by_status(&self) -> Result<Vec<(ItemStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM items GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: HashMap<ItemStatus, i64> = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            counts.insert(status.parse()?, row.try_get("n")?);
        }
        Ok(ItemStatus::ALL
            .iter()
            .map(|s| (*s, counts.get(s).copied().unwrap_or(0)))
            .collect())
    }

    async fn insert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, kind, origin, title, author, raw_text, summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.kind)
        .bind(&source.origin)
        .bind(&source.title)
        .bind(&source.author)
        .bind(&source.raw_text)
        .bind(&source.summary)
        .bind(source.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_highlight(&self, highlight: &Highlight) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let source_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sources WHERE id = ?")
            .bind(&highlight.source_id)
            .fetch_one(&mut *tx)
            .await?;
        if !source_exists {
            anyhow::bail!("source not found: {}", highlight.source_id);
        }

        sqlx::query(
            "INSERT INTO highlights (id, source_id, text, note, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&highlight.id)
        .bind(&highlight.source_id)
        .bind(&highlight.text)
        .bind(&highlight.note)
        .bind(highlight.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO highlights_fts (highlight_id, body)
            SELECT h.id,
                   h.text || char(10) || COALESCE(h.note, '') || char(10) ||
                   COALESCE(s.title, '') || char(10) || COALESCE(s.raw_text, '')
            FROM highlights h JOIN sources s ON s.id = h.source_id
            WHERE h.id = ?
            "#,
        )
        .bind(&highlight.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_embedding(&self, key: &EntityKey, vector: &[f32], model: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (entity_kind, entity_id, model, dims, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(key.kind.as_str())
        .bind(&key.id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<EmbedTarget>> {
        let mut targets = Vec::new();

        let rows = sqlx::query(
            r#"
            SELECT id, COALESCE(title, '') || char(10) || content_text || char(10) ||
                       COALESCE(summary, '') AS text
            FROM items WHERE status = 'processed'
            ORDER BY created_at ASC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            targets.push(EmbedTarget {
                key: EntityKey::item(row.try_get::<String, _>("id")?),
                text: row.try_get("text")?,
            });
        }

        let remaining = limit.saturating_sub(targets.len());
        if remaining > 0 {
            let rows = sqlx::query(
                r#"
                SELECT h.id, h.text || char(10) || COALESCE(h.note, '') AS text
                FROM highlights h
                LEFT JOIN embeddings e ON e.entity_kind = 'highlight' AND e.entity_id = h.id
                WHERE e.entity_id IS NULL
                ORDER BY h.created_at ASC LIMIT ?
                "#,
            )
            .bind(remaining as i64)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                targets.push(EmbedTarget {
                    key: EntityKey::highlight(row.try_get::<String, _>("id")?),
                    text: row.try_get("text")?,
                });
            }
        }

        Ok(targets)
    }

    async fn count_embeddings(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn recent(&self, limit: usize, scope: &SearchScope) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();

        if scope.includes_highlights() {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM highlights h JOIN sources s ON s.id = h.source_id \
                 ORDER BY h.created_at DESC, h.rowid DESC LIMIT ?",
                HIGHLIGHT_COLUMNS
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                entities.push(row_to_highlight_entity(row)?);
            }
        }

        if scope.includes_items() {
            for item in self
                .fetch_items_where("1 = 1", &scope.item_statuses, limit)
                .await?
            {
                entities.push(Entity::Item { item });
            }
        }

        sort_newest_first(&mut entities);
        entities.truncate(limit);
        Ok(entities)
    }

    async fn fulltext_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(EntityKey, f64)>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let mut scored = Vec::new();

        if scope.includes_highlights() {
            let rows = sqlx::query(
                "SELECT highlight_id, rank FROM highlights_fts \
                 WHERE highlights_fts MATCH ? ORDER BY rank LIMIT ?",
            )
            .bind(&fts)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let rank: f64 = row.try_get("rank")?;
                scored.push((
                    EntityKey::highlight(row.try_get::<String, _>("highlight_id")?),
                    rank_to_relevance(rank),
                ));
            }
        }

        if scope.includes_items() {
            let sql = format!(
                "SELECT item_id, rank FROM items_fts \
                 WHERE items_fts MATCH ? \
                   AND item_id IN (SELECT id FROM items WHERE status IN ({})) \
                 ORDER BY rank LIMIT ?",
                placeholders(scope.item_statuses.len())
            );
            let mut q = sqlx::query(&sql).bind(&fts);
            for status in &scope.item_statuses {
                q = q.bind(status.as_str());
            }
            let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;
            for row in rows {
                let rank: f64 = row.try_get("rank")?;
                scored.push((
                    EntityKey::item(row.try_get::<String, _>("item_id")?),
                    rank_to_relevance(rank),
                ));
            }
        }

        sort_best_first(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn substring_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<EntityKey>> {
        let pattern = like_pattern(query.trim());
        let mut keys = Vec::new();

        if scope.includes_highlights() {
            let rows = sqlx::query(
                r"SELECT h.id FROM highlights h JOIN sources s ON s.id = h.source_id
                  WHERE h.text LIKE ? ESCAPE '\'
                     OR h.note LIKE ? ESCAPE '\'
                     OR s.title LIKE ? ESCAPE '\'
                     OR s.raw_text LIKE ? ESCAPE '\'
                  ORDER BY h.created_at DESC LIMIT ?",
            )
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                keys.push(EntityKey::highlight(row.try_get::<String, _>("id")?));
            }
        }

        if scope.includes_items() {
            let sql = format!(
                r"SELECT id FROM items
                  WHERE (title LIKE ? ESCAPE '\'
                         OR content_text LIKE ? ESCAPE '\'
                         OR summary LIKE ? ESCAPE '\')
                    AND status IN ({})
                  ORDER BY created_at DESC LIMIT ?",
                placeholders(scope.item_statuses.len())
            );
            let mut q = sqlx::query(&sql)
                .bind(&pattern)
                .bind(&pattern)
                .bind(&pattern);
            for status in &scope.item_statuses {
                q = q.bind(status.as_str());
            }
            let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;
            for row in rows {
                keys.push(EntityKey::item(row.try_get::<String, _>("id")?));
            }
        }

        Ok(keys)
    }

    async fn load_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        let highlight_ids: Vec<&str> = keys
            .iter()
            .filter(|k| k.kind == EntityKind::Highlight)
            .map(|k| k.id.as_str())
            .collect();
        let item_ids: Vec<&str> = keys
            .iter()
            .filter(|k| k.kind == EntityKind::Item)
            .map(|k| k.id.as_str())
            .collect();

        let mut entities = Vec::with_capacity(keys.len());

        if !highlight_ids.is_empty() {
            let sql = format!(
                "SELECT {} FROM highlights h JOIN sources s ON s.id = h.source_id \
                 WHERE h.id IN ({})",
                HIGHLIGHT_COLUMNS,
                placeholders(highlight_ids.len())
            );
            let mut q = sqlx::query(&sql);
            for id in &highlight_ids {
                q = q.bind(*id);
            }
            for row in q.fetch_all(&self.pool).await? {
                entities.push(row_to_highlight_entity(&row)?);
            }
        }

        if !item_ids.is_empty() {
            let sql = format!(
                "SELECT {} FROM items WHERE id IN ({})",
                ITEM_COLUMNS,
                placeholders(item_ids.len())
            );
            let mut q = sqlx::query(&sql);
            for id in &item_ids {
                q = q.bind(*id);
            }
            for row in q.fetch_all(&self.pool).await? {
                entities.push(Entity::Item {
                    item: row_to_item(&row)?,
                });
            }
        }

        Ok(entities)
    }

    async fn vector_matches(
        &self,
        query: &[f32],
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(EntityKey, f64)>> {
        let mut scored = Vec::new();

        if scope.includes_highlights() {
            scored.extend(
                self.vector_scan(EntityKind::Highlight, "", &[], query)
                    .await?,
            );
        }
        if scope.includes_items() {
            let filter = format!(
                "AND entity_id IN (SELECT id FROM items WHERE status IN ({}))",
                placeholders(scope.item_statuses.len())
            );
            scored.extend(
                self.vector_scan(EntityKind::Item, &filter, &scope.item_statuses, query)
                    .await?,
            );
        }

        sort_best_first(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn tag_matches(
        &self,
        tags: &[String],
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<Entity>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let mut entities = Vec::new();

        if scope.includes_highlights() {
            let clause = vec![
                "(instr(h.text, ?) > 0 OR instr(COALESCE(h.note, ''), ?) > 0 \
                  OR instr(COALESCE(s.title, ''), ?) > 0 OR instr(COALESCE(s.raw_text, ''), ?) > 0)";
                tags.len()
            ]
            .join(" AND ");
            let sql = format!(
                "SELECT {} FROM highlights h JOIN sources s ON s.id = h.source_id \
                 WHERE {} ORDER BY h.created_at DESC, h.rowid DESC LIMIT ?",
                HIGHLIGHT_COLUMNS, clause
            );
            let mut q = sqlx::query(&sql);
            for tag in tags {
                q = q.bind(tag).bind(tag).bind(tag).bind(tag);
            }
            for row in q.bind(limit as i64).fetch_all(&self.pool).await? {
                entities.push(row_to_highlight_entity(&row)?);
            }
        }

        if scope.includes_items() {
            let clause = vec![
                "(instr(COALESCE(title, ''), ?) > 0 OR instr(content_text, ?) > 0 \
                  OR instr(COALESCE(summary, ''), ?) > 0 OR instr(tags_json, ?) > 0)";
                tags.len()
            ]
            .join(" AND ");
            let sql = format!(
                "SELECT {} FROM items WHERE {} AND status IN ({}) \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?",
                ITEM_COLUMNS,
                clause,
                placeholders(scope.item_statuses.len())
            );
            let mut q = sqlx::query(&sql);
            for tag in tags {
                q = q.bind(tag).bind(tag).bind(tag).bind(tag);
            }
            for status in &scope.item_statuses {
                q = q.bind(status.as_str());
            }
            for row in q.bind(limit as i64).fetch_all(&self.pool).await? {
                entities.push(Entity::Item {
                    item: row_to_item(&row)?,
                });
            }
        }

        sort_newest_first(&mut entities);
        entities.truncate(limit);
        Ok(entities)
    }
}
