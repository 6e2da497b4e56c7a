//! Indexing stage: embed processed content and promote items to `indexed`.
//!
//! Runs after ingestion, independently of it. Each pass pulls batches of
//! [`EmbedTarget`]s from the store, embeds them with the configured
//! [`Embedder`], stores the vectors, and moves items `processed -> indexed`.
//! Highlights have no status; storing their vector is enough.
//!
//! A batch that fails to embed stops the pass. Its targets stay pending and
//! are picked up by the next run.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::models::{EntityKind, ItemStatus};
use crate::store::{EmbedTarget, SqliteStore, Store};

#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexReport {
    pub embedded: usize,
    pub indexed_items: usize,
    pub failed: usize,
}

pub struct IndexStage {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl IndexStage {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Embed pending targets until none are left, `limit` is reached, or
    /// `cancel` fires. Cancellation ends the pass between batches.
    pub async fn run(&self, limit: Option<usize>, cancel: &CancellationToken) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let mut budget = limit.unwrap_or(usize::MAX);

        while budget > 0 && !cancel.is_cancelled() {
            let batch = self
                .store
                .pending_embeddings(self.batch_size.min(budget))
                .await?;
            if batch.is_empty() {
                break;
            }
            budget = budget.saturating_sub(batch.len());

            let stored = self.index_batch(&batch, &mut report).await;
            if stored == 0 {
                // Nothing moved out of the pending set; another pass would
                // fetch the same batch.
                break;
            }
        }

        info!(
            embedded = report.embedded,
            indexed = report.indexed_items,
            failed = report.failed,
            "indexing pass complete"
        );
        Ok(report)
    }

    /// Returns how many targets left the pending set.
    async fn index_batch(&self, batch: &[EmbedTarget], report: &mut IndexReport) -> usize {
        let texts: Vec<String> = batch.iter().map(|t| t.text.clone()).collect();
        let vectors = match self.embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => vectors,
            Ok(vectors) => {
                warn!(
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch returned wrong number of vectors"
                );
                report.failed += batch.len();
                return 0;
            }
            Err(e) => {
                warn!(error = %e, size = batch.len(), "embedding batch failed");
                report.failed += batch.len();
                return 0;
            }
        };

        let model = self.embedder.model_name();
        let mut stored = 0;
        for (target, vector) in batch.iter().zip(vectors.iter()) {
            if let Err(e) = self.store.upsert_embedding(&target.key, vector, model).await {
                warn!(id = %target.key.id, error = %e, "failed to store embedding");
                report.failed += 1;
                continue;
            }
            report.embedded += 1;

            if target.key.kind == EntityKind::Item {
                match self
                    .store
                    .transition_item(&target.key.id, ItemStatus::Processed, ItemStatus::Indexed)
                    .await
                {
                    Ok(true) => {
                        report.indexed_items += 1;
                        stored += 1;
                    }
                    // Already moved by a concurrent pass.
                    Ok(false) => stored += 1,
                    Err(e) => {
                        warn!(id = %target.key.id, error = %e, "failed to mark item indexed");
                        report.failed += 1;
                    }
                }
            } else {
                stored += 1;
            }
        }
        stored
    }
}

/// CLI entry point for `cap index`.
pub async fn run_index(config: &Config, limit: Option<usize>) -> Result<()> {
    let Some(embedder) = create_embedder(&config.embedding)? else {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    };

    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let stage = IndexStage::new(store, embedder, config.embedding.batch_size);

    let report = stage.run(limit, &CancellationToken::new()).await?;

    println!("index");
    println!("  embedded: {}", report.embedded);
    println!("  items indexed: {}", report.indexed_items);
    println!("  failed: {}", report.failed);

    pool.close().await;
    Ok(())
}
