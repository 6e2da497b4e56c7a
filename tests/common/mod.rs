#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use capture_harness::db;
use capture_harness::embedding::Embedder;
use capture_harness::enrich::Enricher;
use capture_harness::error::{EnrichError, FetchError};
use capture_harness::extract::HtmlExtractor;
use capture_harness::fetch::{FeedFetcher, FetchOutcome};
use capture_harness::ingest::{IngestPipeline, IngestSettings};
use capture_harness::migrate;
use capture_harness::models::{
    Enrichment, Entity, EntityKey, Feed, Highlight, InsertOutcome, Item, ItemContent, ItemStatus,
    NewItem, SearchScope, Source, Validators,
};
use capture_harness::store::{EmbedTarget, SqliteStore, Store};

/// A migrated SQLite store in a temporary directory.
pub async fn temp_store() -> (TempDir, Arc<dyn Store>) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("cap.sqlite")).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    (tmp, Arc::new(SqliteStore::new(pool)))
}

pub fn rss(items: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Test Feed</title><link>https://blog.example.com/</link>
<description>fixtures</description>"#,
    );
    for (guid, link, title) in items {
        xml.push_str("<item>");
        if !guid.is_empty() {
            xml.push_str(&format!("<guid isPermaLink=\"false\">{}</guid>", guid));
        }
        xml.push_str(&format!(
            "<title>{}</title><link>{}</link><pubDate>Mon, 06 May 2024 10:00:00 GMT</pubDate></item>",
            title, link
        ));
    }
    xml.push_str("</channel></rss>");
    xml.into_bytes()
}

pub fn three_entries() -> Vec<u8> {
    rss(&[
        ("post-1", "https://blog.example.com/tokio", "Tokio internals"),
        ("post-2", "https://blog.example.com/serde", "Serde derive tricks"),
        ("post-3", "https://blog.example.com/axum", "Routing with axum"),
    ])
}

pub fn page(text: &str) -> Vec<u8> {
    format!(
        "<html><head><title>x</title></head><body><nav>menu</nav><article><p>{}</p></article></body></html>",
        text
    )
    .into_bytes()
}

pub fn three_pages() -> HashMap<String, Vec<u8>> {
    HashMap::from([
        (
            "https://blog.example.com/tokio".to_string(),
            page("The tokio scheduler steals work between threads."),
        ),
        (
            "https://blog.example.com/serde".to_string(),
            page("Serde derive macros generate visitor code."),
        ),
        (
            "https://blog.example.com/axum".to_string(),
            page("Axum routers compose tower services."),
        ),
    ])
}

// ============ fetcher ============

#[derive(Clone)]
pub enum FeedResponse {
    Fresh { body: Vec<u8>, validators: Validators },
    NotModified,
    Unreachable,
}

pub struct ScriptedFetcher {
    feed: Mutex<FeedResponse>,
    pages: HashMap<String, Vec<u8>>,
    pub sent_validators: Mutex<Vec<Validators>>,
    pub feed_calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(feed: FeedResponse, pages: HashMap<String, Vec<u8>>) -> Self {
        Self {
            feed: Mutex::new(feed),
            pages,
            sent_validators: Mutex::new(Vec::new()),
            feed_calls: AtomicUsize::new(0),
        }
    }

    pub fn fresh(body: Vec<u8>, etag: Option<&str>, last_modified: Option<&str>) -> FeedResponse {
        FeedResponse::Fresh {
            body,
            validators: Validators {
                etag: etag.map(str::to_string),
                last_modified: last_modified.map(str::to_string),
            },
        }
    }

    pub fn respond(&self, feed: FeedResponse) {
        *self.feed.lock().unwrap() = feed;
    }

    pub fn calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch_feed(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchOutcome, FetchError> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        self.sent_validators.lock().unwrap().push(validators.clone());
        let response = self.feed.lock().unwrap().clone();
        match response {
            FeedResponse::Fresh { body, validators } => Ok(FetchOutcome::Fresh { body, validators }),
            FeedResponse::NotModified => Ok(FetchOutcome::NotModified),
            FeedResponse::Unreachable => Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            }),
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.pages.get(url).cloned().ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

// ============ enrichers ============

/// Fails the first `failures` calls, then summarises.
pub struct FlakyEnricher {
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyEnricher {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(0)
    }

    pub fn always_failing() -> Self {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for FlakyEnricher {
    async fn enrich(&self, text: &str, max_chars: usize) -> Result<Enrichment, EnrichError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(EnrichError::Status(500));
        }
        let summary: String = text.chars().take(max_chars.min(40)).collect();
        Ok(Enrichment {
            summary: format!("Summary: {}", summary),
            tags: vec!["rust".to_string(), "fixture".to_string()],
        })
    }
}

pub fn pipeline(
    store: Arc<dyn Store>,
    fetcher: Arc<ScriptedFetcher>,
    enricher: Arc<dyn Enricher>,
    settings: IngestSettings,
) -> IngestPipeline {
    IngestPipeline::new(store, fetcher, Arc::new(HtmlExtractor), enricher, settings)
}

// ============ embedder ============

/// Deterministic bag-of-words embedder over a fixed vocabulary.
pub struct KeywordEmbedder {
    vocabulary: Vec<&'static str>,
    pub fail: bool,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: Vec<&'static str>) -> Self {
        Self {
            vocabulary,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            vocabulary: vec!["unused"],
            fail: true,
        }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        self.vocabulary.len()
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.fail {
            anyhow::bail!("embedding backend offline");
        }
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                self.vocabulary
                    .iter()
                    .map(|word| lower.matches(word).count() as f32)
                    .collect()
            })
            .collect())
    }
}

// ============ store ============

/// Delegates to an inner store but fails every `complete_item` write.
pub struct CompleteFailingStore {
    inner: Arc<dyn Store>,
}

impl CompleteFailingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for CompleteFailingStore {
    async fn create_feed(&self, url: &str, title: Option<&str>) -> anyhow::Result<Feed> {
        self.inner.create_feed(url, title).await
    }

    async fn get_feed(&self, id: &str) -> anyhow::Result<Option<Feed>> {
        self.inner.get_feed(id).await
    }

    async fn list_feeds(&self, active_only: bool) -> anyhow::Result<Vec<Feed>> {
        self.inner.list_feeds(active_only).await
    }

    async fn set_feed_active(&self, id: &str, active: bool) -> anyhow::Result<bool> {
        self.inner.set_feed_active(id, active).await
    }

    async fn update_feed_validators(&self, id: &str, validators: &Validators) -> anyhow::Result<()> {
        self.inner.update_feed_validators(id, validators).await
    }

    async fn item_exists(&self, feed_id: &str, dedup_key: &str) -> anyhow::Result<bool> {
        self.inner.item_exists(feed_id, dedup_key).await
    }

    async fn insert_item(&self, item: &NewItem) -> anyhow::Result<InsertOutcome> {
        self.inner.insert_item(item).await
    }

    async fn complete_item(&self, _id: &str, _content: &ItemContent) -> anyhow::Result<bool> {
        anyhow::bail!("disk I/O error")
    }

    async fn mark_item_failed(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.mark_item_failed(id).await
    }

    async fn transition_item(
        &self,
        id: &str,
        from: ItemStatus,
        to: ItemStatus,
    ) -> anyhow::Result<bool> {
        self.inner.transition_item(id, from, to).await
    }

    async fn record_enrichment(
        &self,
        id: &str,
        enrichment: Option<&Enrichment>,
    ) -> anyhow::Result<()> {
        self.inner.record_enrichment(id, enrichment).await
    }

    async fn items_pending_enrichment(
        &self,
        feed_id: &str,
        max_attempts: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>> {
        self.inner
            .items_pending_enrichment(feed_id, max_attempts, limit)
            .await
    }

    async fn stalled_items(
        &self,
        feed_id: &str,
        created_before: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>> {
        self.inner.stalled_items(feed_id, created_before, limit).await
    }

    async fn get_item(&self, id: &str) -> anyhow::Result<Option<Item>> {
        self.inner.get_item(id).await
    }

    async fn list_items(
        &self,
        feed_id: Option<&str>,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> anyhow::Result<Vec<Item>> {
        self.inner.list_items(feed_id, status, limit).await
    }

    async fn count_items_by_status(&self) -> anyhow::Result<Vec<(ItemStatus, i64)>> {
        self.inner.count_items_by_status().await
    }

    async fn insert_source(&self, source: &Source) -> anyhow::Result<()> {
        self.inner.insert_source(source).await
    }

    async fn insert_highlight(&self, highlight: &Highlight) -> anyhow::Result<()> {
        self.inner.insert_highlight(highlight).await
    }

    async fn upsert_embedding(
        &self,
        key: &EntityKey,
        vector: &[f32],
        model: &str,
    ) -> anyhow::Result<()> {
        self.inner.upsert_embedding(key, vector, model).await
    }

    async fn pending_embeddings(&self, limit: usize) -> anyhow::Result<Vec<EmbedTarget>> {
        self.inner.pending_embeddings(limit).await
    }

    async fn count_embeddings(&self) -> anyhow::Result<i64> {
        self.inner.count_embeddings().await
    }

    async fn recent(&self, limit: usize, scope: &SearchScope) -> anyhow::Result<Vec<Entity>> {
        self.inner.recent(limit, scope).await
    }

    async fn fulltext_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> anyhow::Result<Vec<(EntityKey, f64)>> {
        self.inner.fulltext_matches(query, limit, scope).await
    }

    async fn substring_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> anyhow::Result<Vec<EntityKey>> {
        self.inner.substring_matches(query, limit, scope).await
    }

    async fn load_entities(&self, keys: &[EntityKey]) -> anyhow::Result<Vec<Entity>> {
        self.inner.load_entities(keys).await
    }

    async fn vector_matches(
        &self,
        query: &[f32],
        limit: usize,
        scope: &SearchScope,
    ) -> anyhow::Result<Vec<(EntityKey, f64)>> {
        self.inner.vector_matches(query, limit, scope).await
    }

    async fn tag_matches(
        &self,
        tags: &[String],
        limit: usize,
        scope: &SearchScope,
    ) -> anyhow::Result<Vec<Entity>> {
        self.inner.tag_matches(tags, limit, scope).await
    }
}
