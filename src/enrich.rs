//! Best-effort enrichment (summary + tags) over a prompt-completion endpoint.
//!
//! [`OllamaEnricher`] issues two `POST {base_url}/api/generate` calls with
//! `stream: false` and reads the `response` field of each: one prompt asks
//! for a short summary, the other for comma-separated tags. Input text is
//! truncated to `max_chars` characters first. Any failure is reported as
//! an [`EnrichError`]; the pipeline logs it and moves on.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EnrichmentConfig;
use crate::error::EnrichError;
use crate::models::Enrichment;

#[async_trait]
pub trait Enricher: Send + Sync {
    /// `false` for the disabled enricher; the pipeline then skips the
    /// call and does not count an attempt.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn enrich(&self, text: &str, max_chars: usize) -> Result<Enrichment, EnrichError>;
}

/// Used when `enrichment.provider = "disabled"`.
pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn enrich(&self, _text: &str, _max_chars: usize) -> Result<Enrichment, EnrichError> {
        Err(EnrichError::Disabled)
    }
}

pub struct OllamaEnricher {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    async fn generate(&self, prompt: String) -> Result<String, EnrichError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichError::Timeout
                } else {
                    EnrichError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Status(status.as_u16()));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::Malformed(e.to_string()))?;
        Ok(body.response.trim().to_string())
    }
}

#[async_trait]
impl Enricher for OllamaEnricher {
    async fn enrich(&self, text: &str, max_chars: usize) -> Result<Enrichment, EnrichError> {
        let input = truncate_chars(text, max_chars);

        let summary = self
            .generate(format!(
                "Summarize the following text in at most two sentences:\n\n{}",
                input
            ))
            .await?;
        if summary.is_empty() {
            return Err(EnrichError::Malformed("empty summary".to_string()));
        }

        let tags = parse_tags(
            &self
                .generate(format!(
                    "Suggest 3 to 7 short tags for the following text, \
                     as a single comma-separated line:\n\n{}",
                    input
                ))
                .await?,
        );
        debug!(model = %self.model, tags = tags.len(), "enrichment complete");

        Ok(Enrichment { summary, tags })
    }
}

/// The first `max_chars` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split a model's tag line into clean, de-duplicated tags.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for part in raw.split([',', '\n']) {
        let tag = part
            .trim()
            .trim_start_matches(['-', '*', '#'])
            .trim_matches(['"', '\'', '.'])
            .trim();
        if tag.is_empty() || tags.iter().any(|t| t == tag) {
            continue;
        }
        tags.push(tag.to_string());
    }
    tags
}

/// Create the [`Enricher`] named by `enrichment.provider`.
pub fn create_enricher(config: &EnrichmentConfig) -> Result<Arc<dyn Enricher>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEnricher)),
        "ollama" => Ok(Arc::new(OllamaEnricher::new(config)?)),
        other => bail!("Unknown enrichment provider: {}", other),
    }
}
