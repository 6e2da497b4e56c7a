//! Feed ingestion pipeline.
//!
//! [`IngestPipeline::ingest`] brings one feed's entries into the item
//! store:
//!
//! ```text
//! conditional fetch ─▶ parse ─▶ dedup key ─▶ exists? ─▶ insert (new)
//!        │                                              │
//!    304: stop                          fetch page ─▶ extract ─▶ enrich
//!                                                              │
//!                                                 complete (processed)
//! ```
//!
//! Only the feed fetch and the store are allowed to fail a run. Parse,
//! extraction and enrichment failures degrade the affected entry and are
//! logged. Running `ingest` repeatedly or concurrently for the same feed
//! never duplicates items: the `(feed_id, dedup_key)` unique constraint
//! turns a lost insert race into [`InsertOutcome::Conflict`].
//!
//! Validators are written only after every entry of a fresh body has been
//! handled, so an interrupted run refetches the same body next time.
//!
//! With [`EnrichmentRetry::NextPoll`], items whose enrichment failed in an
//! earlier run are enriched again before the new entries are handled.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, EnrichmentRetry};
use crate::dedup::dedup_key;
use crate::enrich::{create_enricher, Enricher};
use crate::error::{EnrichError, IngestError};
use crate::extract::{ContentExtractor, HtmlExtractor};
use crate::fetch::{FeedFetcher, FetchOutcome, HttpFetcher};
use crate::models::{
    now_millis, EntryRecord, Enrichment, Feed, InsertOutcome, ItemContent, NewItem,
};
use crate::parse::parse_entries;
use crate::store::Store;

/// Tunables for [`IngestPipeline`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_chars: usize,
    pub enrichment_timeout: Duration,
    pub enrichment_retry: EnrichmentRetry,
    pub max_enrichment_attempts: i64,
    pub retry_batch: usize,
    pub stalled_after: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_chars: config.enrichment.max_chars,
            enrichment_timeout: Duration::from_secs(config.enrichment.timeout_secs),
            enrichment_retry: config.ingest.enrichment_retry,
            max_enrichment_attempts: config.ingest.max_enrichment_attempts,
            retry_batch: config.ingest.retry_batch,
            stalled_after: Duration::from_secs(config.ingest.stalled_after_secs),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from_config(&Config::minimal("unused.sqlite"))
    }
}

/// Counters for one [`IngestPipeline::ingest`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub feed_id: String,
    /// The server answered 304; nothing else happened.
    pub not_modified: bool,
    /// The feed is deactivated; nothing was fetched.
    pub inactive: bool,
    pub parse_failed: bool,
    pub entries: usize,
    pub inserted: usize,
    /// Entries whose dedup key was already stored.
    pub existing: usize,
    /// Inserts that lost a race with a concurrent run.
    pub conflicts: usize,
    /// Entries with neither guid nor link.
    pub skipped: usize,
    pub processed: usize,
    pub failed: usize,
    pub empty_bodies: usize,
    pub enriched: usize,
    pub enrichment_failures: usize,
    pub recovered: usize,
}

impl IngestReport {
    fn new(feed_id: &str) -> Self {
        Self {
            feed_id: feed_id.to_string(),
            ..Default::default()
        }
    }
}

pub struct IngestPipeline {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn FeedFetcher>,
    extractor: Arc<dyn ContentExtractor>,
    enricher: Arc<dyn Enricher>,
    settings: IngestSettings,
}

/// Race `fut` against cancellation.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, IngestError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IngestError::Cancelled),
        out = fut => Ok(out),
    }
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn FeedFetcher>,
        extractor: Arc<dyn ContentExtractor>,
        enricher: Arc<dyn Enricher>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            enricher,
            settings,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        Ok(Self::new(
            store,
            Arc::new(HttpFetcher::new(&config.fetch)?),
            Arc::new(HtmlExtractor),
            create_enricher(&config.enrichment)?,
            IngestSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Ingest one feed. Idempotent and safe to call concurrently.
    ///
    /// # Errors
    ///
    /// - [`IngestError::FeedNotFound`] for an unknown id.
    /// - [`IngestError::TransientNetwork`] when the feed body cannot be
    ///   fetched; the feed is left untouched.
    /// - [`IngestError::BackendUnavailable`] when the store fails.
    /// - [`IngestError::Cancelled`] when `cancel` fires.
    pub async fn ingest(
        &self,
        feed_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let feed = self
            .store
            .get_feed(feed_id)
            .await
            .map_err(IngestError::backend)?
            .ok_or_else(|| IngestError::FeedNotFound(feed_id.to_string()))?;

        let mut report = IngestReport::new(&feed.id);
        if !feed.active {
            debug!(feed_id = %feed.id, "feed inactive, skipping");
            report.inactive = true;
            return Ok(report);
        }

        let stored = feed.validators();
        let outcome = cancellable(cancel, self.fetcher.fetch_feed(&feed.url, &stored))
            .await?
            .map_err(|source| IngestError::TransientNetwork {
                feed_id: feed.id.clone(),
                source,
            })?;

        let (body, fresh) = match outcome {
            FetchOutcome::NotModified => {
                debug!(feed_id = %feed.id, "not modified");
                report.not_modified = true;
                return Ok(report);
            }
            FetchOutcome::Fresh { body, validators } => (body, validators),
        };

        let entries = match parse_entries(&body) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(feed_id = %feed.id, url = %feed.url, error = %e, "feed parse failed");
                report.parse_failed = true;
                Vec::new()
            }
        };
        report.entries = entries.len();

        // Before the entry loop, so only attempts from earlier runs are retried.
        if self.settings.enrichment_retry == EnrichmentRetry::NextPoll {
            self.retry_enrichment(&feed, cancel, &mut report).await?;
        }

        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            self.ingest_entry(&feed, entry, cancel, &mut report).await?;
        }

        self.recover_stalled(&feed, cancel, &mut report).await?;

        let merged = stored.merge(&fresh);
        if merged != stored {
            self.store
                .update_feed_validators(&feed.id, &merged)
                .await
                .map_err(IngestError::backend)?;
        }

        info!(
            feed_id = %feed.id,
            entries = report.entries,
            inserted = report.inserted,
            existing = report.existing,
            processed = report.processed,
            failed = report.failed,
            "feed ingested"
        );
        Ok(report)
    }

    async fn ingest_entry(
        &self,
        feed: &Feed,
        entry: &EntryRecord,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let Some(identity) = entry.identity() else {
            warn!(feed_id = %feed.id, title = ?entry.title, "entry has neither guid nor link, skipping");
            report.skipped += 1;
            return Ok(());
        };
        let key = dedup_key(identity);

        if self
            .store
            .item_exists(&feed.id, &key)
            .await
            .map_err(IngestError::backend)?
        {
            report.existing += 1;
            return Ok(());
        }

        let item = NewItem {
            id: uuid::Uuid::new_v4().to_string(),
            feed_id: feed.id.clone(),
            dedup_key: key,
            link: entry.link.clone(),
            title: entry.title.clone(),
            author: entry.author.clone(),
            published_at: entry.published.map(|p| p.timestamp_millis()),
            raw: entry.snapshot(),
        };

        match self
            .store
            .insert_item(&item)
            .await
            .map_err(IngestError::backend)?
        {
            InsertOutcome::Inserted => report.inserted += 1,
            InsertOutcome::Conflict => {
                debug!(feed_id = %feed.id, dedup_key = %item.dedup_key, "lost insert race");
                report.conflicts += 1;
                return Ok(());
            }
        }

        self.process_item(&item.id, item.link.as_deref(), cancel, report)
            .await
    }

    /// Extract, enrich and complete an item that is in status `new`.
    ///
    /// On cancellation the item is still completed, with whatever content
    /// was gathered so far, before `Cancelled` is returned.
    async fn process_item(
        &self,
        item_id: &str,
        link: Option<&str>,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let mut content = ItemContent::default();
        let gathered = self.gather_content(link, cancel, &mut content, report).await;
        self.complete(item_id, &content, report).await?;
        gathered
    }

    async fn gather_content(
        &self,
        link: Option<&str>,
        cancel: &CancellationToken,
        content: &mut ItemContent,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        content.body = self.extract_body(link, cancel).await?;
        if content.body.is_empty() {
            report.empty_bodies += 1;
            return Ok(());
        }

        if self.enricher.is_enabled() {
            content.enrichment_attempted = true;
            content.enrichment = self.enrich_body(&content.body, cancel).await?;
            match content.enrichment {
                Some(_) => report.enriched += 1,
                None => report.enrichment_failures += 1,
            }
        }
        Ok(())
    }

    /// Page fetch + extraction. Every failure yields an empty body;
    /// only cancellation is an error.
    async fn extract_body(
        &self,
        link: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, IngestError> {
        let Some(link) = link else {
            return Ok(String::new());
        };

        let raw = match cancellable(cancel, self.fetcher.fetch_page(link)).await? {
            Ok(raw) => raw,
            Err(e) => {
                warn!(url = %link, error = %e, "page fetch failed, continuing without body");
                return Ok(String::new());
            }
        };

        match self.extractor.extract(&raw) {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(url = %link, error = %e, "content extraction failed, continuing without body");
                Ok(String::new())
            }
        }
    }

    /// Enrichment under the configured timeout. Failures yield `None`.
    async fn enrich_body(
        &self,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Enrichment>, IngestError> {
        let call = tokio::time::timeout(
            self.settings.enrichment_timeout,
            self.enricher.enrich(body, self.settings.max_chars),
        );
        let result = match cancellable(cancel, call).await? {
            Ok(result) => result,
            Err(_) => Err(EnrichError::Timeout),
        };

        match result {
            Ok(enrichment) => Ok(Some(enrichment)),
            Err(e) => {
                warn!(error = %e, "enrichment failed");
                Ok(None)
            }
        }
    }

    /// Move `new -> processed`, or `new -> failed` if the write itself fails.
    async fn complete(
        &self,
        item_id: &str,
        content: &ItemContent,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        match self.store.complete_item(item_id, content).await {
            Ok(true) => {
                report.processed += 1;
                Ok(())
            }
            Ok(false) => {
                debug!(item_id, "item already left state new");
                Ok(())
            }
            Err(e) => {
                warn!(item_id, error = %e, "failed to persist item content, marking failed");
                self.store
                    .mark_item_failed(item_id)
                    .await
                    .map_err(IngestError::backend)?;
                report.failed += 1;
                Ok(())
            }
        }
    }

    /// Process items of this feed left in `new` by an interrupted run.
    async fn recover_stalled(
        &self,
        feed: &Feed,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let cutoff = now_millis() - self.settings.stalled_after.as_millis() as i64;
        let stalled = self
            .store
            .stalled_items(&feed.id, cutoff, self.settings.retry_batch)
            .await
            .map_err(IngestError::backend)?;

        for item in stalled {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            info!(item_id = %item.id, "recovering stalled item");
            report.recovered += 1;
            self.process_item(&item.id, item.link.as_deref(), cancel, report)
                .await?;
        }
        Ok(())
    }

    /// Re-attempt enrichment for items that have a body but no summary.
    ///
    /// Runs once per fresh fetch, so each item gets at most one attempt per run.
    async fn retry_enrichment(
        &self,
        feed: &Feed,
        cancel: &CancellationToken,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        if !self.enricher.is_enabled() {
            return Ok(());
        }

        let pending = self
            .store
            .items_pending_enrichment(
                &feed.id,
                self.settings.max_enrichment_attempts,
                self.settings.retry_batch,
            )
            .await
            .map_err(IngestError::backend)?;

        for item in pending {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let enrichment = self.enrich_body(&item.content_text, cancel).await?;
            match enrichment {
                Some(_) => report.enriched += 1,
                None => report.enrichment_failures += 1,
            }
            self.store
                .record_enrichment(&item.id, enrichment.as_ref())
                .await
                .map_err(IngestError::backend)?;
        }
        Ok(())
    }

    /// Ingest every active feed in turn, logging per-feed failures.
    pub async fn ingest_all(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<IngestReport>> {
        let feeds = self.store.list_feeds(true).await?;
        let mut reports = Vec::with_capacity(feeds.len());
        for feed in feeds {
            match self.ingest(&feed.id, cancel).await {
                Ok(report) => reports.push(report),
                Err(IngestError::Cancelled) => break,
                Err(e) => warn!(feed_id = %feed.id, error = %e, "feed ingestion failed"),
            }
        }
        Ok(reports)
    }
}

/// CLI entry point for `cap sync`.
pub async fn run_sync(config: &Config, feed_id: Option<&str>) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::new(pool));
    let pipeline = IngestPipeline::from_config(config, store)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let reports = match feed_id {
        Some(id) => vec![pipeline.ingest(id, &cancel).await?],
        None => pipeline.ingest_all(&cancel).await?,
    };

    for r in &reports {
        if r.inactive {
            println!("{}: inactive, skipped", r.feed_id);
        } else if r.not_modified {
            println!("{}: not modified", r.feed_id);
        } else {
            println!(
                "{}: {} entries, {} new, {} existing, {} processed, {} failed",
                r.feed_id, r.entries, r.inserted, r.existing, r.processed, r.failed
            );
        }
    }
    println!("ok");
    Ok(())
}
