mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use capture_harness::config::EnrichmentRetry;
use capture_harness::enrich::DisabledEnricher;
use capture_harness::error::IngestError;
use capture_harness::ingest::IngestSettings;
use capture_harness::models::{ItemContent, ItemStatus, NewItem};
use capture_harness::store::Store;

use common::*;

#[tokio::test]
async fn test_ingest_processes_new_entries() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), Some("\"v1\""), None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.entries, 3);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);

    let items = store.list_items(Some(&feed.id), None, 10).await.unwrap();
    assert_eq!(items.len(), 3);
    for item in &items {
        assert_eq!(item.status, ItemStatus::Processed);
        assert_eq!(item.enrich_attempts, 0);
        assert!(item.summary.is_none());
    }
    let tokio = items
        .iter()
        .find(|i| i.title.as_deref() == Some("Tokio internals"))
        .unwrap();
    assert!(tokio.content_text.contains("steals work"));
    assert!(!tokio.content_text.contains("menu"));
    assert!(tokio.published_at.is_some());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    let cancel = CancellationToken::new();

    p.ingest(&feed.id, &cancel).await.unwrap();
    let second = p.ingest(&feed.id, &cancel).await.unwrap();

    assert_eq!(second.inserted, 0);
    assert_eq!(second.existing, 3);
    assert_eq!(store.list_items(Some(&feed.id), None, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_not_modified_has_no_side_effects() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), Some("\"v1\""), Some("Mon, 06 May 2024 10:00:00 GMT")),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher.clone(),
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    let cancel = CancellationToken::new();
    p.ingest(&feed.id, &cancel).await.unwrap();
    let before = store.list_items(Some(&feed.id), None, 10).await.unwrap();

    fetcher.respond(FeedResponse::NotModified);
    let report = p.ingest(&feed.id, &cancel).await.unwrap();

    assert!(report.not_modified);
    assert_eq!(report.inserted + report.existing + report.processed, 0);

    // The stored validators were sent as conditional headers.
    let sent = fetcher.sent_validators.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].is_empty());
    assert_eq!(sent[1].etag.as_deref(), Some("\"v1\""));

    let after_feed = store.get_feed(&feed.id).await.unwrap().unwrap();
    assert_eq!(after_feed.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        after_feed.last_modified.as_deref(),
        Some("Mon, 06 May 2024 10:00:00 GMT")
    );
    let after = store.list_items(Some(&feed.id), None, 10).await.unwrap();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, b.status);
        assert_eq!(a.content_text, b.content_text);
    }
}

#[tokio::test]
async fn test_missing_validator_keeps_previous_value() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), Some("\"a\""), Some("Mon, 06 May 2024 10:00:00 GMT")),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher.clone(),
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    let cancel = CancellationToken::new();
    p.ingest(&feed.id, &cancel).await.unwrap();

    fetcher.respond(ScriptedFetcher::fresh(three_entries(), Some("\"b\""), None));
    p.ingest(&feed.id, &cancel).await.unwrap();

    let feed = store.get_feed(&feed.id).await.unwrap().unwrap();
    assert_eq!(feed.etag.as_deref(), Some("\"b\""));
    assert_eq!(
        feed.last_modified.as_deref(),
        Some("Mon, 06 May 2024 10:00:00 GMT")
    );
}

#[tokio::test]
async fn test_malformed_feed_yields_no_items() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(b"this is not a feed <<<".to_vec(), None, None),
        HashMap::new(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert!(report.parse_failed);
    assert_eq!(report.entries, 0);
    assert!(store.list_items(None, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_feed_is_transient() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(FeedResponse::Unreachable, HashMap::new()));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let err = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::TransientNetwork { .. }));
    let feed = store.get_feed(&feed.id).await.unwrap().unwrap();
    assert!(feed.validators().is_empty());
}

#[tokio::test]
async fn test_unknown_and_inactive_feeds() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher.clone(),
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    let cancel = CancellationToken::new();

    let err = p.ingest("no-such-feed", &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::FeedNotFound(_)));

    assert!(store.set_feed_active(&feed.id, false).await.unwrap());
    let report = p.ingest(&feed.id, &cancel).await.unwrap();
    assert!(report.inactive);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_extraction_failure_still_processes() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    // No pages: every page fetch returns 404.
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        HashMap::new(),
    ));
    let enricher = Arc::new(FlakyEnricher::always_ok());
    let p = pipeline(store.clone(), fetcher, enricher.clone(), IngestSettings::default());

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.empty_bodies, 3);
    // Nothing to summarise, so the enricher is never called.
    assert_eq!(enricher.calls(), 0);

    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert_eq!(item.status, ItemStatus::Processed);
        assert!(item.content_text.is_empty());
    }
}

#[tokio::test]
async fn test_enrichment_failure_keeps_item_without_summary() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(FlakyEnricher::always_failing()),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.enrichment_failures, 3);

    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert_eq!(item.status, ItemStatus::Processed);
        assert!(item.summary.is_none());
        assert!(item.tags.is_empty());
        assert!(!item.content_text.is_empty());
        assert_eq!(item.enrich_attempts, 1);
    }
}

#[tokio::test]
async fn test_enrichment_success_stores_summary_and_tags() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(FlakyEnricher::always_ok()),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.enriched, 3);

    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert!(item.summary.as_deref().unwrap().starts_with("Summary: "));
        assert_eq!(item.tags, vec!["rust".to_string(), "fixture".to_string()]);
    }
}

#[tokio::test]
async fn test_never_policy_does_not_retry_enrichment() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let enricher = Arc::new(FlakyEnricher::new(3));
    let p = pipeline(store.clone(), fetcher, enricher.clone(), IngestSettings::default());
    let cancel = CancellationToken::new();

    p.ingest(&feed.id, &cancel).await.unwrap();
    let second = p.ingest(&feed.id, &cancel).await.unwrap();

    assert_eq!(enricher.calls(), 3);
    assert_eq!(second.enriched, 0);
    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert!(item.summary.is_none());
    }
}

#[tokio::test]
async fn test_next_poll_policy_retries_enrichment() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let enricher = Arc::new(FlakyEnricher::new(3));
    let settings = IngestSettings {
        enrichment_retry: EnrichmentRetry::NextPoll,
        ..IngestSettings::default()
    };
    let p = pipeline(store.clone(), fetcher.clone(), enricher.clone(), settings);
    let cancel = CancellationToken::new();

    let first = p.ingest(&feed.id, &cancel).await.unwrap();
    assert_eq!(first.enriched, 0);
    assert_eq!(first.enrichment_failures, 3);
    assert_eq!(enricher.calls(), 3, "no second attempt within the same run");
    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert!(item.summary.is_none());
        assert_eq!(item.enrich_attempts, 1);
    }

    let second = p.ingest(&feed.id, &cancel).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.enriched, 3);
    assert_eq!(enricher.calls(), 6);
    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert!(item.summary.is_some());
        assert_eq!(item.enrich_attempts, 2);
    }

    // A 304 never triggers the retry pass.
    fetcher.respond(FeedResponse::NotModified);
    p.ingest(&feed.id, &cancel).await.unwrap();
    assert_eq!(enricher.calls(), 6);
}

#[tokio::test]
async fn test_retry_makes_one_attempt_per_run_up_to_max() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let enricher = Arc::new(FlakyEnricher::always_failing());
    let settings = IngestSettings {
        enrichment_retry: EnrichmentRetry::NextPoll,
        max_enrichment_attempts: 3,
        ..IngestSettings::default()
    };
    let p = pipeline(store.clone(), fetcher, enricher.clone(), settings);
    let cancel = CancellationToken::new();

    for (run, expected_calls) in [(1_i64, 3_usize), (2, 6), (3, 9), (4, 9)] {
        p.ingest(&feed.id, &cancel).await.unwrap();
        assert_eq!(enricher.calls(), expected_calls, "after run {}", run);
        for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
            assert_eq!(item.enrich_attempts, run.min(3));
        }
    }

    for item in store.list_items(Some(&feed.id), None, 10).await.unwrap() {
        assert_eq!(item.status, ItemStatus::Processed);
    }
}

#[tokio::test]
async fn test_dedup_by_canonical_link_when_guid_missing() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let body = rss(&[
        ("", "https://blog.example.com/tokio?utm_source=rss", "Tokio internals"),
        ("", "https://BLOG.example.com/tokio#comments", "Tokio internals (again)"),
    ]);
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(body, None, None),
        HashMap::new(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.existing, 1);
    assert_eq!(store.list_items(Some(&feed.id), None, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_do_not_duplicate() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let make = || {
        pipeline(
            store.clone(),
            Arc::new(ScriptedFetcher::new(
                ScriptedFetcher::fresh(three_entries(), None, None),
                three_pages(),
            )),
            Arc::new(DisabledEnricher),
            IngestSettings::default(),
        )
    };
    let (a, b) = (make(), make());
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(a.ingest(&feed.id, &cancel), b.ingest(&feed.id, &cancel));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.inserted + rb.inserted, 3);
    assert_eq!(store.list_items(Some(&feed.id), None, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), Some("\"v1\""), None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = p.ingest(&feed.id, &cancel).await.unwrap_err();
    assert!(matches!(err, IngestError::Cancelled));
    assert!(store.list_items(None, None, 10).await.unwrap().is_empty());
    assert!(store.get_feed(&feed.id).await.unwrap().unwrap().etag.is_none());
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );
    p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    let item = store.list_items(Some(&feed.id), None, 1).await.unwrap().remove(0);
    assert_eq!(item.status, ItemStatus::Processed);

    // No way back to new, and failed is only reachable from new.
    assert!(!store
        .transition_item(&item.id, ItemStatus::Processed, ItemStatus::New)
        .await
        .unwrap());
    assert!(!store.mark_item_failed(&item.id).await.unwrap());
    assert!(!store.complete_item(&item.id, &ItemContent::default()).await.unwrap());

    assert!(store
        .transition_item(&item.id, ItemStatus::Processed, ItemStatus::Indexed)
        .await
        .unwrap());
    // Stale source status is rejected.
    assert!(!store
        .transition_item(&item.id, ItemStatus::Processed, ItemStatus::Indexed)
        .await
        .unwrap());
    let item = store.get_item(&item.id).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Indexed);
    assert!(!item.content_text.is_empty());
}

#[tokio::test]
async fn test_failed_content_write_marks_item_failed() {
    let (_tmp, inner) = temp_store().await;
    let store: Arc<dyn Store> = Arc::new(CompleteFailingStore::new(inner.clone()));
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(three_entries(), Some("\"v1\""), None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.inserted, 3);
    assert_eq!(report.processed, 0);
    assert_eq!(report.failed, 3);
    let items = inner.list_items(Some(&feed.id), None, 10).await.unwrap();
    assert_eq!(items.len(), 3);
    for item in &items {
        assert_eq!(item.status, ItemStatus::Failed);
    }

    // Failed items are terminal: a later poll neither re-inserts nor revisits them.
    let again = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.existing, 3);
    assert_eq!(again.failed, 0);
}

async fn insert_new_item(store: &dyn Store, feed_id: &str, id: &str, link: &str) {
    store
        .insert_item(&NewItem {
            id: id.to_string(),
            feed_id: feed_id.to_string(),
            dedup_key: format!("key-{}", id),
            link: Some(link.to_string()),
            title: Some("Left behind".to_string()),
            author: None,
            published_at: None,
            raw: serde_json::json!({}),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stalled_items_are_recovered() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    insert_new_item(store.as_ref(), &feed.id, "stalled", "https://blog.example.com/tokio").await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(rss(&[]), None, None),
        three_pages(),
    ));
    let settings = IngestSettings {
        stalled_after: Duration::ZERO,
        ..IngestSettings::default()
    };
    let p = pipeline(store.clone(), fetcher, Arc::new(DisabledEnricher), settings);

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(report.processed, 1);
    let item = store.get_item("stalled").await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Processed);
    assert!(item.content_text.contains("tokio scheduler"));
}

#[tokio::test]
async fn test_recent_new_items_are_not_recovered() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    insert_new_item(store.as_ref(), &feed.id, "in-flight", "https://blog.example.com/tokio").await;

    let fetcher = Arc::new(ScriptedFetcher::new(
        ScriptedFetcher::fresh(rss(&[]), None, None),
        three_pages(),
    ));
    let p = pipeline(
        store.clone(),
        fetcher,
        Arc::new(DisabledEnricher),
        IngestSettings::default(),
    );

    let report = p.ingest(&feed.id, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.recovered, 0);
    let item = store.get_item("in-flight").await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::New);
}

#[tokio::test]
async fn test_stalled_lookup_skips_fresh_rows() {
    let (_tmp, store) = temp_store().await;
    let feed = store.create_feed("https://blog.example.com/feed.xml", None).await.unwrap();
    insert_new_item(store.as_ref(), &feed.id, "old", "https://blog.example.com/tokio").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cutoff = capture_harness::models::now_millis();
    tokio::time::sleep(Duration::from_millis(20)).await;
    for i in 0..5 {
        insert_new_item(
            store.as_ref(),
            &feed.id,
            &format!("fresh-{}", i),
            "https://blog.example.com/serde",
        )
        .await;
    }

    let stalled = store.stalled_items(&feed.id, cutoff, 2).await.unwrap();
    let ids: Vec<_> = stalled.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["old"]);
}
