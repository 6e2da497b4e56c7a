//! Outbound HTTP: conditional feed fetch and entry page fetch.
//!
//! The [`FeedFetcher`] trait is the pipeline's only network seam for
//! documents. [`HttpFetcher`] is the `reqwest` implementation; tests
//! substitute an in-memory fake.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::models::Validators;

/// Result of a conditional feed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server answered `304 Not Modified`.
    NotModified,
    /// A new body, with whatever validators the response carried.
    Fresh {
        body: Vec<u8>,
        validators: Validators,
    },
}

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// GET the feed document, sending `validators` as conditional headers.
    async fn fetch_feed(&self, url: &str, validators: &Validators)
        -> Result<FetchOutcome, FetchError>;

    /// GET an entry's own page for content extraction.
    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`FeedFetcher`] over a shared `reqwest` client.
pub struct HttpFetcher {
    client: Client,
    feed_timeout: Duration,
    page_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            client,
            feed_timeout: Duration::from_secs(config.timeout_secs),
            page_timeout: Duration::from_secs(config.page_timeout_secs),
        })
    }
}

fn network_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            source: err,
        }
    }
}

fn header_value(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch_feed(
        &self,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url).timeout(self.feed_timeout);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|e| network_error(url, e))?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(url, "feed not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let fresh = Validators {
            etag: header_value(response.headers(), ETAG),
            last_modified: header_value(response.headers(), LAST_MODIFIED),
        };
        let body = response.bytes().await.map_err(|e| network_error(url, e))?;
        debug!(url, bytes = body.len(), "fetched feed body");

        Ok(FetchOutcome::Fresh {
            body: body.to_vec(),
            validators: fresh,
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.page_timeout)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| network_error(url, e))?;
        Ok(body.to_vec())
    }
}
