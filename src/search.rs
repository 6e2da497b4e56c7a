//! Hybrid retrieval over highlights and feed items.
//!
//! # Pipeline
//!
//! ```text
//! query ──┬─▶ text stage ───┐
//!         │                 ├─▶ reciprocal rank fusion ─▶ truncate(limit)
//!         └─▶ vector stage ─┘
//! ```
//!
//! - **Empty query**: the `limit` most recent entities, tagged `recent`, score 1.0.
//! - **Text stage**: candidates must pass a pre-filter (FTS5 match or
//!   case-insensitive substring). Each is scored
//!   `similarity_weight * max trigram similarity over its text fields
//!   + fulltext_weight * full-text relevance`, and the best
//!   `candidate_factor * limit` are kept.
//! - **Vector stage**: cosine similarity of the query embedding against
//!   stored vectors; empty when no [`Embedder`] is configured.
//! - **Fusion**: `text_weight / (k + rank_text) + vector_weight / (k + rank_vector)`,
//!   with no contribution from a list the entity is absent from. Ties keep
//!   text-stage order.
//! - **Tags**: a separate filter; every tag must appear (case-sensitive) in
//!   the entity's text. Score 1.0, tagged `tag`.
//!
//! A failing stage is logged and dropped; if nothing is left the result
//! is empty. Only cancellation is reported as an error.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{create_embedder, embed_one, Embedder};
use crate::error::SearchError;
use crate::models::{Corpus, Entity, EntityKey, MatchType, SearchResult, SearchScope};
use crate::similarity::max_similarity;
use crate::store::Store;

/// Parameters of [`SearchEngine::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// When non-empty, runs tag search instead of hybrid ranking.
    pub tags: Vec<String>,
    pub limit: usize,
    pub corpus: Corpus,
}

/// One entry of a fused ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub key: EntityKey,
    pub score: f64,
    pub match_type: MatchType,
}

/// Reciprocal rank fusion of a text ranking and a vector ranking.
///
/// Ranks are 1-based. The output is sorted by score, descending; the sort
/// is stable over an input order of text candidates first, then
/// vector-only candidates, so ties keep text-stage order.
pub fn fuse(
    text: &[EntityKey],
    vector: &[EntityKey],
    k: f64,
    text_weight: f64,
    vector_weight: f64,
) -> Vec<Fused> {
    fn ranks(list: &[EntityKey]) -> HashMap<&EntityKey, usize> {
        let mut ranks = HashMap::with_capacity(list.len());
        for (i, key) in list.iter().enumerate() {
            ranks.entry(key).or_insert(i + 1);
        }
        ranks
    }

    let text_ranks = ranks(text);
    let vector_ranks = ranks(vector);

    let mut seen = HashSet::new();
    let mut fused: Vec<Fused> = text
        .iter()
        .chain(vector.iter())
        .filter(|key| seen.insert(*key))
        .map(|key| {
            let rt = text_ranks.get(key);
            let rv = vector_ranks.get(key);
            let score = rt.map_or(0.0, |r| text_weight / (k + *r as f64))
                + rv.map_or(0.0, |r| vector_weight / (k + *r as f64));
            let match_type = match (rt, rv) {
                (Some(_), Some(_)) => MatchType::Hybrid,
                (Some(_), None) => MatchType::Text,
                _ => MatchType::Vector,
            };
            Fused {
                key: key.clone(),
                score,
                match_type,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused
}

/// Blend of the two lexical signals of the text stage.
pub fn text_score(
    similarity: f64,
    fulltext: f64,
    similarity_weight: f64,
    fulltext_weight: f64,
) -> f64 {
    similarity_weight * similarity + fulltext_weight * fulltext
}

#[derive(Debug)]
struct Scored {
    entity: Entity,
    score: f64,
}

pub struct SearchEngine {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    config: RetrievalConfig,
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, SearchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SearchError::Cancelled),
        out = fut => Ok(out),
    }
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn Embedder>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    fn scope(&self, corpus: Corpus) -> SearchScope {
        SearchScope {
            corpus,
            item_statuses: self.config.eligible_statuses.clone(),
        }
    }

    /// Route a request to tag search, the recent fallback, or hybrid ranking.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let scope = self.scope(request.corpus);

        if !request.tags.is_empty() {
            return self
                .tag_search(&request.tags, request.limit, &scope, cancel)
                .await;
        }
        if request.query.trim().is_empty() {
            return self.recent(request.limit, &scope, cancel).await;
        }
        self.hybrid(request.query.trim(), request.limit, &scope, cancel)
            .await
    }

    pub async fn recent(
        &self,
        limit: usize,
        scope: &SearchScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let entities = match cancellable(cancel, self.store.recent(limit, scope)).await? {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "recent lookup failed");
                Vec::new()
            }
        };
        Ok(fixed_score(entities, MatchType::Recent))
    }

    pub async fn tag_search(
        &self,
        tags: &[String],
        limit: usize,
        scope: &SearchScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let entities = match cancellable(cancel, self.store.tag_matches(tags, limit, scope)).await? {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "tag search failed");
                Vec::new()
            }
        };
        Ok(fixed_score(entities, MatchType::Tag))
    }

    async fn hybrid(
        &self,
        query: &str,
        limit: usize,
        scope: &SearchScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let n = limit.saturating_mul(self.config.candidate_factor);

        let (text, vector) = cancellable(cancel, async {
            tokio::join!(
                self.text_stage(query, n, scope),
                self.vector_stage(query, n, scope)
            )
        })
        .await?;

        let text = text.unwrap_or_else(|e| {
            warn!(error = %e, "text ranking failed, continuing without it");
            Vec::new()
        });
        let vector = vector.unwrap_or_else(|e| {
            warn!(error = %e, "vector ranking failed, continuing without it");
            Vec::new()
        });

        let text_keys: Vec<EntityKey> = text.iter().map(|s| s.entity.key()).collect();
        let vector_keys: Vec<EntityKey> = vector.iter().map(|(k, _)| k.clone()).collect();
        let mut fused = fuse(
            &text_keys,
            &vector_keys,
            self.config.rrf_k,
            self.config.text_weight,
            self.config.vector_weight,
        );
        fused.truncate(limit);

        let mut entities: HashMap<EntityKey, Entity> = text
            .into_iter()
            .map(|s| (s.entity.key(), s.entity))
            .collect();
        let missing: Vec<EntityKey> = fused
            .iter()
            .filter(|f| !entities.contains_key(&f.key))
            .map(|f| f.key.clone())
            .collect();
        if !missing.is_empty() {
            match cancellable(cancel, self.store.load_entities(&missing)).await? {
                Ok(loaded) => {
                    for entity in loaded {
                        entities.insert(entity.key(), entity);
                    }
                }
                Err(e) => warn!(error = %e, "failed to load vector-only candidates"),
            }
        }

        let results: Vec<SearchResult> = fused
            .into_iter()
            .filter_map(|f| {
                entities.remove(&f.key).map(|entity| SearchResult {
                    entity,
                    score: f.score,
                    match_type: f.match_type,
                })
            })
            .collect();
        debug!(query, results = results.len(), "hybrid search complete");
        Ok(results)
    }

    /// Pre-filter, score and rank lexical candidates.
    ///
    /// Fails only when both pre-filters fail or candidates cannot be loaded.
    async fn text_stage(&self, query: &str, n: usize, scope: &SearchScope) -> Result<Vec<Scored>> {
        let pool = self.config.prefilter_pool.max(n);

        let fulltext = self.store.fulltext_matches(query, pool, scope).await;
        let substring = self.store.substring_matches(query, pool, scope).await;
        let (fulltext, substring) = match (fulltext, substring) {
            (Err(fe), Err(se)) => {
                anyhow::bail!("full-text: {}; substring: {}", fe, se)
            }
            (fulltext, substring) => (
                fulltext.unwrap_or_else(|e| {
                    warn!(error = %e, "full-text pre-filter failed");
                    Vec::new()
                }),
                substring.unwrap_or_else(|e| {
                    warn!(error = %e, "substring pre-filter failed");
                    Vec::new()
                }),
            ),
        };

        let relevance: HashMap<EntityKey, f64> = fulltext.iter().cloned().collect();
        let mut seen = HashSet::new();
        let keys: Vec<EntityKey> = fulltext
            .into_iter()
            .map(|(key, _)| key)
            .chain(substring)
            .filter(|key| seen.insert(key.clone()))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let order: HashMap<EntityKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
        let mut entities = self.store.load_entities(&keys).await?;
        entities.sort_by_key(|e| order.get(&e.key()).copied().unwrap_or(usize::MAX));

        let mut scored: Vec<Scored> = entities
            .into_iter()
            .map(|entity| {
                let similarity = max_similarity(query, entity.text_fields());
                let fulltext = relevance.get(&entity.key()).copied().unwrap_or(0.0);
                let score = text_score(
                    similarity,
                    fulltext,
                    self.config.similarity_weight,
                    self.config.fulltext_weight,
                );
                Scored { entity, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(n);
        Ok(scored)
    }

    async fn vector_stage(
        &self,
        query: &str,
        n: usize,
        scope: &SearchScope,
    ) -> Result<Vec<(EntityKey, f64)>> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };
        let query_vec = embed_one(embedder.as_ref(), query).await?;
        self.store.vector_matches(&query_vec, n, scope).await
    }
}

fn fixed_score(entities: Vec<Entity>, match_type: MatchType) -> Vec<SearchResult> {
    entities
        .into_iter()
        .map(|entity| SearchResult {
            entity,
            score: 1.0,
            match_type,
        })
        .collect()
}

/// CLI entry point for `cap search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    tags: Vec<String>,
    corpus: Corpus,
    limit: Option<usize>,
) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
    let embedder = create_embedder(&config.embedding)?;
    let engine = SearchEngine::new(store, embedder, config.retrieval.clone());

    let request = SearchRequest {
        query: query.to_string(),
        tags,
        limit: limit.unwrap_or(config.retrieval.default_limit),
        corpus,
    };
    let results = engine
        .search(&request, &CancellationToken::new())
        .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(position: usize, result: &SearchResult) {
    let title = result.entity.title().unwrap_or("(untitled)");
    let date = chrono::DateTime::from_timestamp_millis(result.entity.created_at())
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    println!(
        "{}. [{:.4}] ({}) {}",
        position,
        result.score,
        result.match_type.as_str(),
        title
    );
    println!("    created: {}", date);
    match &result.entity {
        Entity::Highlight { highlight, .. } => {
            println!("    highlight: \"{}\"", excerpt(&highlight.text));
            if let Some(note) = &highlight.note {
                println!("    note: {}", excerpt(note));
            }
            println!("    id: {}", highlight.id);
        }
        Entity::Item { item } => {
            if let Some(link) = &item.link {
                println!("    url: {}", link);
            }
            let text = item.summary.as_deref().unwrap_or(&item.content_text);
            if !text.is_empty() {
                println!("    excerpt: \"{}\"", excerpt(text));
            }
            println!("    id: {}", item.id);
        }
    }
    println!();
}

fn excerpt(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    match trimmed.char_indices().nth(160) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
