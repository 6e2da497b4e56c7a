//! Error taxonomy for the ingestion pipeline and retrieval engine.
//!
//! Each stage boundary returns its own error type so the orchestrating
//! loop can decide per kind whether to continue, skip the entry, or
//! abort the feed:
//!
//! | Kind | Raised by | Handling |
//! |------|-----------|----------|
//! | [`FetchError`] | feed / page fetch | feed fetch: abort the run; page fetch: empty body |
//! | [`ParseError`] | feed parsing | logged, treated as zero entries |
//! | [`ExtractError`] | content extraction | logged, empty body |
//! | [`EnrichError`] | enrichment call | logged, no enrichment |
//! | [`IngestError`] | [`crate::ingest`] | surfaced to the caller |
//! | [`SearchError`] | [`crate::search`] | surfaced to the caller |
//!
//! Duplicate inserts are not an error: see
//! [`InsertOutcome::Conflict`](crate::models::InsertOutcome).

use thiserror::Error;

/// Failure fetching a feed body or an entry page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} timed out")]
    Timeout { url: String },
}

/// A feed document that could not be parsed.
#[derive(Debug, Error)]
#[error("malformed feed document: {0}")]
pub struct ParseError(pub String);

/// Content extraction failure.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("document is empty")]
    Empty,
    #[error("no readable text found")]
    NoText,
}

/// Enrichment call failure. Always absorbed by the pipeline.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment is disabled")]
    Disabled,
    #[error("enrichment request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("enrichment service returned HTTP {0}")]
    Status(u16),
    #[error("malformed enrichment response: {0}")]
    Malformed(String),
    #[error("enrichment timed out")]
    Timeout,
}

/// Errors surfaced by [`IngestPipeline::ingest`](crate::ingest::IngestPipeline::ingest).
#[derive(Debug, Error)]
pub enum IngestError {
    /// The feed body could not be fetched. Retried by the next poll.
    #[error("transient network failure for feed {feed_id}: {source}")]
    TransientNetwork {
        feed_id: String,
        #[source]
        source: FetchError,
    },
    #[error("feed not found: {0}")]
    FeedNotFound(String),
    /// The store cannot be read or written.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[source] anyhow::Error),
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn backend(err: anyhow::Error) -> Self {
        IngestError::BackendUnavailable(err)
    }
}

/// Errors surfaced by the retrieval engine.
///
/// Backend failures never appear here: search degrades to whatever
/// signals remain, down to an empty list.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search cancelled")]
    Cancelled,
}
