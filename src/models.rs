//! Core data models.
//!
//! Feeds and items are written by the ingestion pipeline ([`crate::ingest`]).
//! Sources and highlights are captured outside the pipeline and are only
//! read by the retrieval engine ([`crate::search`]). Timestamps are stored
//! as Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A subscribed feed and its conditional-fetch validators.
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: String,
    /// Canonical feed URL (unique).
    pub url: String,
    pub title: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

impl Feed {
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

/// HTTP cache validators (`ETag` / `Last-Modified`). Opaque strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Combine the validators of a fresh response with the stored ones.
    ///
    /// A header the response omits keeps its previous value; a known
    /// validator is never cleared.
    pub fn merge(&self, fresh: &Validators) -> Validators {
        Validators {
            etag: fresh.etag.clone().or_else(|| self.etag.clone()),
            last_modified: fresh
                .last_modified
                .clone()
                .or_else(|| self.last_modified.clone()),
        }
    }
}

/// Processing status of an [`Item`].
///
/// ```text
/// new ──▶ processed ──▶ indexed
///  │
///  └───▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    New,
    Processed,
    Indexed,
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::New,
        ItemStatus::Processed,
        ItemStatus::Indexed,
        ItemStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Processed => "processed",
            ItemStatus::Indexed => "indexed",
            ItemStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal edge of the status machine.
    ///
    /// Every other edge, including self-loops, is rejected.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::New, ItemStatus::Processed)
                | (ItemStatus::Processed, ItemStatus::Indexed)
                | (ItemStatus::New, ItemStatus::Failed)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ItemStatus::New),
            "processed" => Ok(ItemStatus::Processed),
            "indexed" => Ok(ItemStatus::Indexed),
            "failed" => Ok(ItemStatus::Failed),
            other => anyhow::bail!("unknown item status: '{}'", other),
        }
    }
}

/// One ingested feed entry.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: String,
    pub feed_id: String,
    pub dedup_key: String,
    pub link: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    /// Extracted body text; empty when extraction failed.
    pub content_text: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing)]
    pub raw: serde_json::Value,
    pub status: ItemStatus,
    pub enrich_attempts: i64,
    pub created_at: i64,
}

/// Everything known about a feed entry after parsing.
///
/// Every field is optional: feeds routinely omit any of them. Built by
/// [`crate::parse::parse_entries`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryRecord {
    pub guid: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary_html: Option<String>,
}

impl EntryRecord {
    /// The identity string used for de-duplication: the native guid when
    /// present, otherwise the link.
    pub fn identity(&self) -> Option<&str> {
        self.guid
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .or_else(|| self.link.as_deref().filter(|l| !l.trim().is_empty()))
    }

    /// JSON snapshot stored alongside the item for auditing.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Row written when an entry is first claimed.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: String,
    pub feed_id: String,
    pub dedup_key: String,
    pub link: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<i64>,
    pub raw: serde_json::Value,
}

/// Result of inserting a [`NewItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// `(feed_id, dedup_key)` already existed. Not an error.
    Conflict,
}

/// Summary and tags produced by an [`Enricher`](crate::enrich::Enricher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrichment {
    pub summary: String,
    pub tags: Vec<String>,
}

/// Content written when an item leaves `new`.
#[derive(Debug, Clone, Default)]
pub struct ItemContent {
    pub body: String,
    pub enrichment: Option<Enrichment>,
    pub enrichment_attempted: bool,
}

/// A captured document.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: String,
    /// Document type, e.g. `web`, `pdf`, `book`.
    pub kind: String,
    pub origin: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub raw_text: Option<String>,
    pub summary: Option<String>,
    pub created_at: i64,
}

/// A user-selected excerpt of exactly one [`Source`].
#[derive(Debug, Clone, Serialize)]
pub struct Highlight {
    pub id: String,
    pub source_id: String,
    pub text: String,
    pub note: Option<String>,
    pub created_at: i64,
}

// ============ Retrieval ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Highlight,
    Item,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Highlight => "highlight",
            EntityKind::Item => "item",
        }
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "highlight" => Ok(EntityKind::Highlight),
            "item" => Ok(EntityKind::Item),
            other => anyhow::bail!("unknown entity kind: '{}'", other),
        }
    }
}

/// Identity of a rankable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn highlight(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Highlight,
            id: id.into(),
        }
    }

    pub fn item(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Item,
            id: id.into(),
        }
    }
}

/// An entity the retrieval engine ranks over.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Highlight { highlight: Highlight, source: Source },
    Item { item: Item },
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Highlight { highlight, .. } => EntityKey::highlight(&highlight.id),
            Entity::Item { item } => EntityKey::item(&item.id),
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            Entity::Highlight { highlight, .. } => highlight.created_at,
            Entity::Item { item } => item.created_at,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            Entity::Highlight { source, .. } => source.title.as_deref(),
            Entity::Item { item } => item.title.as_deref(),
        }
    }

    /// The text fields scored by the lexical stage: title, body, note.
    pub fn text_fields(&self) -> Vec<&str> {
        let mut fields = Vec::with_capacity(3);
        match self {
            Entity::Highlight { highlight, source } => {
                fields.push(highlight.text.as_str());
                if let Some(note) = highlight.note.as_deref() {
                    fields.push(note);
                }
                if let Some(title) = source.title.as_deref() {
                    fields.push(title);
                }
                if let Some(raw) = source.raw_text.as_deref() {
                    fields.push(raw);
                }
            }
            Entity::Item { item } => {
                if let Some(title) = item.title.as_deref() {
                    fields.push(title);
                }
                fields.push(item.content_text.as_str());
                if let Some(summary) = item.summary.as_deref() {
                    fields.push(summary);
                }
            }
        }
        fields
    }
}

/// Provenance of a [`SearchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Text,
    Vector,
    Hybrid,
    Recent,
    Tag,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Text => "text",
            MatchType::Vector => "vector",
            MatchType::Hybrid => "hybrid",
            MatchType::Recent => "recent",
            MatchType::Tag => "tag",
        }
    }
}

/// One ranked entity. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub entity: Entity,
    pub score: f64,
    pub match_type: MatchType,
}

/// Which entity collections a search considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Corpus {
    #[default]
    All,
    Highlights,
    Items,
}

impl FromStr for Corpus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Corpus::All),
            "highlights" => Ok(Corpus::Highlights),
            "items" => Ok(Corpus::Items),
            other => anyhow::bail!(
                "unknown corpus: '{}'. Must be all, highlights, or items.",
                other
            ),
        }
    }
}

/// Filter applied by every store-side search query.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub corpus: Corpus,
    /// Item statuses eligible for retrieval.
    pub item_statuses: Vec<ItemStatus>,
}

impl SearchScope {
    pub fn includes_highlights(&self) -> bool {
        matches!(self.corpus, Corpus::All | Corpus::Highlights)
    }

    pub fn includes_items(&self) -> bool {
        matches!(self.corpus, Corpus::All | Corpus::Items) && !self.item_statuses.is_empty()
    }
}
