//! Storage abstraction.
//!
//! The [`Store`] trait is the single seam between the ingestion pipeline,
//! the retrieval engine, and the database. [`SqliteStore`] is the only
//! production backend; tests may wrap or replace it.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Enrichment, Entity, EntityKey, Feed, Highlight, InsertOutcome, Item, ItemContent, ItemStatus,
    NewItem, SearchScope, Source, Validators,
};

/// Text to embed for one entity, returned by [`Store::pending_embeddings`].
#[derive(Debug, Clone)]
pub struct EmbedTarget {
    pub key: EntityKey,
    pub text: String,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Feeds | [`create_feed`](Store::create_feed), [`get_feed`](Store::get_feed), [`list_feeds`](Store::list_feeds), [`set_feed_active`](Store::set_feed_active), [`update_feed_validators`](Store::update_feed_validators) |
/// | Items | [`item_exists`](Store::item_exists), [`insert_item`](Store::insert_item), [`complete_item`](Store::complete_item), [`mark_item_failed`](Store::mark_item_failed), [`transition_item`](Store::transition_item), [`record_enrichment`](Store::record_enrichment), [`items_pending_enrichment`](Store::items_pending_enrichment), [`stalled_items`](Store::stalled_items), [`get_item`](Store::get_item), [`list_items`](Store::list_items), [`count_items_by_status`](Store::count_items_by_status) |
/// | Capture | [`insert_source`](Store::insert_source), [`insert_highlight`](Store::insert_highlight) |
/// | Vectors | [`upsert_embedding`](Store::upsert_embedding), [`pending_embeddings`](Store::pending_embeddings), [`count_embeddings`](Store::count_embeddings) |
/// | Retrieval | [`recent`](Store::recent), [`fulltext_matches`](Store::fulltext_matches), [`substring_matches`](Store::substring_matches), [`load_entities`](Store::load_entities), [`vector_matches`](Store::vector_matches), [`tag_matches`](Store::tag_matches) |
///
/// Status changes are compare-and-set: they only apply when the item is
/// still in the expected source status, and report whether they applied.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- feeds ----

    /// Subscribe to a feed. Fails if the URL is already subscribed.
    async fn create_feed(&self, url: &str, title: Option<&str>) -> Result<Feed>;

    async fn get_feed(&self, id: &str) -> Result<Option<Feed>>;

    async fn list_feeds(&self, active_only: bool) -> Result<Vec<Feed>>;

    /// Returns `false` if no feed has this id.
    async fn set_feed_active(&self, id: &str, active: bool) -> Result<bool>;

    async fn update_feed_validators(&self, id: &str, validators: &Validators) -> Result<()>;

    // ---- items ----

    async fn item_exists(&self, feed_id: &str, dedup_key: &str) -> Result<bool>;

    /// Insert an item in status `new`. A `(feed_id, dedup_key)` conflict
    /// is reported as [`InsertOutcome::Conflict`], not an error.
    async fn insert_item(&self, item: &NewItem) -> Result<InsertOutcome>;

    /// Write extracted content and enrichment and move `new -> processed`.
    async fn complete_item(&self, id: &str, content: &ItemContent) -> Result<bool>;

    /// Move `new -> failed`.
    async fn mark_item_failed(&self, id: &str) -> Result<bool>;

    /// Move `from -> to`. Illegal edges are rejected without touching the row.
    async fn transition_item(&self, id: &str, from: ItemStatus, to: ItemStatus) -> Result<bool>;

    /// Record an enrichment attempt, storing the result when there is one.
    async fn record_enrichment(&self, id: &str, enrichment: Option<&Enrichment>) -> Result<()>;

    /// Items of a feed with a body but no summary and fewer than
    /// `max_attempts` enrichment attempts.
    async fn items_pending_enrichment(
        &self,
        feed_id: &str,
        max_attempts: i64,
        limit: usize,
    ) -> Result<Vec<Item>>;

    /// Items of a feed still in `new` that were created at or before
    /// `created_before` (Unix millis), oldest first.
    async fn stalled_items(
        &self,
        feed_id: &str,
        created_before: i64,
        limit: usize,
    ) -> Result<Vec<Item>>;

    async fn get_item(&self, id: &str) -> Result<Option<Item>>;

    /// Most recent first.
    async fn list_items(
        &self,
        feed_id: Option<&str>,
        status: Option<ItemStatus>,
        limit: usize,
    ) -> Result<Vec<Item>>;

    async fn count_items_by_status(&self) -> Result<Vec<(ItemStatus, i64)>>;

    // ---- sources & highlights ----

    async fn insert_source(&self, source: &Source) -> Result<()>;

    async fn insert_highlight(&self, highlight: &Highlight) -> Result<()>;

    // ---- vectors ----

    async fn upsert_embedding(&self, key: &EntityKey, vector: &[f32], model: &str) -> Result<()>;

    /// Items still in `processed` and highlights without a stored vector,
    /// oldest first, items before highlights.
    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<EmbedTarget>>;

    async fn count_embeddings(&self) -> Result<i64>;

    // ---- retrieval ----

    /// Most recently created entities in scope, newest first.
    async fn recent(&self, limit: usize, scope: &SearchScope) -> Result<Vec<Entity>>;

    /// Full-text matches with a relevance rank in `[0, 1)`, best first.
    async fn fulltext_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(EntityKey, f64)>>;

    /// Entities with a text field containing `query` (case-insensitive).
    async fn substring_matches(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<EntityKey>>;

    /// Load entities by key. Missing keys are skipped; order is not preserved.
    async fn load_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>>;

    /// Cosine similarity of stored vectors against `query`, best first.
    async fn vector_matches(
        &self,
        query: &[f32],
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(EntityKey, f64)>>;

    /// Entities whose text fields contain every tag (case-sensitive), newest first.
    async fn tag_matches(
        &self,
        tags: &[String],
        limit: usize,
        scope: &SearchScope,
    ) -> Result<Vec<Entity>>;
}
