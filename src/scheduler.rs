//! Periodic polling of active feeds.
//!
//! Every `interval_secs` the scheduler starts a tick that lists active feeds
//! and ingests them with at most `max_concurrent_feeds` runs in flight.
//! Ticks are spawned on schedule and do not wait for the previous tick, so
//! one slow feed cannot delay the others. A feed whose previous run has not
//! finished is skipped for that tick. Ingestion is idempotent, so the skip
//! only saves work. Each run is bounded by `run_timeout_secs`; on expiry its
//! cancellation token fires and the run winds down.
//!
//! When an [`IndexStage`] is attached, it runs after each tick unless an
//! earlier tick is still indexing.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::embedding::create_embedder;
use crate::error::IngestError;
use crate::index::IndexStage;
use crate::ingest::IngestPipeline;
use crate::store::{SqliteStore, Store};

/// Outcome counts of one scheduler tick.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TickReport {
    pub feeds: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub timed_out: usize,
    pub inserted: usize,
}

/// Feed ids with a run in progress.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn try_acquire(&self, feed_id: &str) -> Option<FlightGuard> {
        let mut set = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(feed_id.to_string()) {
            return None;
        }
        Some(FlightGuard {
            set: self.0.clone(),
            feed_id: feed_id.to_string(),
        })
    }
}

/// Releases the feed when dropped.
struct FlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    feed_id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.feed_id);
    }
}

enum RunOutcome {
    Done(usize),
    Failed,
    TimedOut,
    Cancelled,
}

/// Cheap to clone; clones share in-flight state and concurrency permits.
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Arc<IngestPipeline>,
    indexer: Option<Arc<IndexStage>>,
    config: SchedulerConfig,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
    indexing: Arc<tokio::sync::Mutex<()>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<IngestPipeline>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_feeds.max(1)));
        Self {
            pipeline,
            indexer: None,
            config,
            in_flight: InFlight::default(),
            permits,
            indexing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<IndexStage>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Poll until `cancel` fires. The first tick runs immediately.
    ///
    /// Returns once every started tick has finished.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            while let Some(done) = ticks.try_join_next() {
                log_tick(done);
            }
            let scheduler = self.clone();
            let tick_cancel = cancel.clone();
            ticks.spawn(async move { scheduler.tick(&tick_cancel).await });
        }

        while let Some(done) = ticks.join_next().await {
            log_tick(done);
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// Ingest every active feed once, then run the indexer if attached.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport> {
        let feeds = self.pipeline.store().list_feeds(true).await?;
        let mut report = TickReport {
            feeds: feeds.len(),
            ..Default::default()
        };
        let run_timeout = Duration::from_secs(self.config.run_timeout_secs);
        let mut runs = JoinSet::new();

        for feed in feeds {
            let Some(guard) = self.in_flight.try_acquire(&feed.id) else {
                debug!(feed_id = %feed.id, "previous run still in flight, skipping");
                report.skipped += 1;
                continue;
            };
            let pipeline = self.pipeline.clone();
            let permits = self.permits.clone();
            let run_cancel = cancel.child_token();

            runs.spawn(async move {
                let _guard = guard;
                let Ok(_permit) = permits.acquire_owned().await else {
                    return RunOutcome::Cancelled;
                };
                match tokio::time::timeout(run_timeout, pipeline.ingest(&feed.id, &run_cancel))
                    .await
                {
                    Ok(Ok(r)) => RunOutcome::Done(r.inserted),
                    Ok(Err(IngestError::Cancelled)) => RunOutcome::Cancelled,
                    Ok(Err(e)) => {
                        warn!(feed_id = %feed.id, error = %e, "scheduled ingestion failed");
                        RunOutcome::Failed
                    }
                    Err(_) => {
                        run_cancel.cancel();
                        warn!(feed_id = %feed.id, "scheduled ingestion timed out");
                        RunOutcome::TimedOut
                    }
                }
            });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(RunOutcome::Done(inserted)) => {
                    report.succeeded += 1;
                    report.inserted += inserted;
                }
                Ok(RunOutcome::Failed) => report.failed += 1,
                Ok(RunOutcome::TimedOut) => report.timed_out += 1,
                Ok(RunOutcome::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "ingestion task panicked");
                    report.failed += 1;
                }
            }
        }

        if let Some(indexer) = &self.indexer {
            if !cancel.is_cancelled() {
                match self.indexing.try_lock() {
                    Ok(_indexing) => {
                        if let Err(e) = indexer.run(None, cancel).await {
                            warn!(error = %e, "indexing after tick failed");
                        }
                    }
                    Err(_) => debug!("indexer still running from an earlier tick, skipping"),
                }
            }
        }

        Ok(report)
    }
}

fn log_tick(done: std::result::Result<Result<TickReport>, JoinError>) {
    match done {
        Ok(Ok(report)) => info!(
            feeds = report.feeds,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            timed_out = report.timed_out,
            inserted = report.inserted,
            "scheduler tick complete"
        ),
        Ok(Err(e)) => warn!(error = %e, "scheduler tick failed"),
        Err(e) => warn!(error = %e, "scheduler tick panicked"),
    }
}

/// CLI entry point for `cap watch`. Runs until Ctrl-C.
pub async fn run_watch(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let pipeline = Arc::new(IngestPipeline::from_config(config, store.clone())?);

    let mut scheduler = Scheduler::new(pipeline, config.scheduler.clone());
    if let Some(embedder) = create_embedder(&config.embedding)? {
        scheduler = scheduler.with_indexer(Arc::new(IndexStage::new(
            store,
            embedder,
            config.embedding.batch_size,
        )));
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    println!(
        "Watching active feeds every {}s (Ctrl-C to stop)",
        config.scheduler.interval_secs
    );
    scheduler.run(&cancel).await?;

    pool.close().await;
    Ok(())
}
