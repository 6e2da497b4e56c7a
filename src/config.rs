use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::ItemStatus;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// A config with every section at its default, pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            fetch: FetchConfig::default(),
            enrichment: EnrichmentConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Timeout for the feed document request.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Timeout for each entry page request (content extraction).
    #[serde(default = "default_fetch_timeout")]
    pub page_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_fetch_timeout(),
            page_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    format!("capture-harness/{}", env!("CARGO_PKG_VERSION"))
}
fn default_fetch_timeout() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_enrichment_model")]
    pub model: String,
    /// Input budget in characters; longer bodies are truncated.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_enrichment_timeout")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: default_ollama_url(),
            model: default_enrichment_model(),
            max_chars: default_max_chars(),
            timeout_secs: default_enrichment_timeout(),
        }
    }
}

impl EnrichmentConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_enrichment_model() -> String {
    "llama3".to_string()
}
fn default_max_chars() -> usize {
    1000
}
fn default_enrichment_timeout() -> u64 {
    45
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            base_url: default_openai_url(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout() -> u64 {
    30
}

/// Ranking weights and candidate sizes for [`crate::search`].
///
/// The text score of a candidate is
/// `similarity_weight * max_trigram(query, fields) + fulltext_weight * fts_rank`.
/// Fusion is `text_weight / (rrf_k + rank_text) + vector_weight / (rrf_k + rank_vector)`.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_fulltext_weight")]
    pub fulltext_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    /// Each ranking stage returns `candidate_factor * limit` candidates.
    #[serde(default = "default_candidate_factor")]
    pub candidate_factor: usize,
    /// Upper bound on pre-filter matches loaded for scoring.
    #[serde(default = "default_prefilter_pool")]
    pub prefilter_pool: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_eligible_statuses")]
    pub eligible_statuses: Vec<ItemStatus>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            fulltext_weight: default_fulltext_weight(),
            rrf_k: default_rrf_k(),
            text_weight: default_text_weight(),
            vector_weight: default_vector_weight(),
            candidate_factor: default_candidate_factor(),
            prefilter_pool: default_prefilter_pool(),
            default_limit: default_limit(),
            eligible_statuses: default_eligible_statuses(),
        }
    }
}

fn default_similarity_weight() -> f64 {
    0.6
}
fn default_fulltext_weight() -> f64 {
    0.4
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_text_weight() -> f64 {
    0.7
}
fn default_vector_weight() -> f64 {
    0.3
}
fn default_candidate_factor() -> usize {
    2
}
fn default_prefilter_pool() -> usize {
    200
}
fn default_limit() -> usize {
    20
}
fn default_eligible_statuses() -> Vec<ItemStatus> {
    vec![ItemStatus::Processed, ItemStatus::Indexed]
}

/// Whether items whose enrichment failed are enriched again later.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentRetry {
    /// Enrichment is attempted once, when the item is first ingested.
    #[default]
    Never,
    /// Retried on the next poll that returns a fresh feed body.
    NextPoll,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub enrichment_retry: EnrichmentRetry,
    #[serde(default = "default_max_enrichment_attempts")]
    pub max_enrichment_attempts: i64,
    #[serde(default = "default_retry_batch")]
    pub retry_batch: usize,
    /// Items still `new` this long after insertion were abandoned by an
    /// interrupted run and are processed again.
    #[serde(default = "default_stalled_after")]
    pub stalled_after_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enrichment_retry: EnrichmentRetry::Never,
            max_enrichment_attempts: default_max_enrichment_attempts(),
            retry_batch: default_retry_batch(),
            stalled_after_secs: default_stalled_after(),
        }
    }
}

fn default_max_enrichment_attempts() -> i64 {
    3
}
fn default_retry_batch() -> usize {
    20
}
fn default_stalled_after() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrent_feeds")]
    pub max_concurrent_feeds: usize,
    /// Upper bound on a single feed's ingestion run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_feeds: default_max_concurrent_feeds(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

fn default_interval_secs() -> u64 {
    30 * 60
}
fn default_max_concurrent_feeds() -> usize {
    4
}
fn default_run_timeout() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    let r = &config.retrieval;
    for (name, value) in [
        ("similarity_weight", r.similarity_weight),
        ("fulltext_weight", r.fulltext_weight),
        ("text_weight", r.text_weight),
        ("vector_weight", r.vector_weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    // With both weights <= 1, k >= 1 keeps a fused score within [0, 1].
    if r.rrf_k < 1.0 {
        anyhow::bail!("retrieval.rrf_k must be >= 1");
    }
    if r.candidate_factor < 1 {
        anyhow::bail!("retrieval.candidate_factor must be >= 1");
    }
    if r.default_limit < 1 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if r.eligible_statuses.is_empty() {
        anyhow::bail!("retrieval.eligible_statuses must not be empty");
    }
    if r.eligible_statuses.contains(&ItemStatus::Failed) {
        anyhow::bail!("retrieval.eligible_statuses must not include 'failed'");
    }

    // Enrichment
    match config.enrichment.provider.as_str() {
        "disabled" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown enrichment provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }
    if config.enrichment.max_chars == 0 {
        anyhow::bail!("enrichment.max_chars must be > 0");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Scheduler
    if config.scheduler.interval_secs == 0 {
        anyhow::bail!("scheduler.interval_secs must be >= 1");
    }
    if config.scheduler.max_concurrent_feeds == 0 {
        anyhow::bail!("scheduler.max_concurrent_feeds must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"./data/cap.sqlite\"\n").unwrap();
        validate(&config).unwrap();

        assert_eq!(config.retrieval.similarity_weight, 0.6);
        assert_eq!(config.retrieval.fulltext_weight, 0.4);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.retrieval.text_weight, 0.7);
        assert_eq!(config.retrieval.vector_weight, 0.3);
        assert_eq!(
            config.retrieval.eligible_statuses,
            vec![ItemStatus::Processed, ItemStatus::Indexed]
        );
        assert_eq!(config.ingest.enrichment_retry, EnrichmentRetry::Never);
        assert_eq!(config.enrichment.max_chars, 1000);
        assert_eq!(config.fetch.page_timeout_secs, 20);
        assert_eq!(config.scheduler.interval_secs, 1800);
        assert!(!config.enrichment.is_enabled());
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_overrides_parse() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "cap.sqlite"

            [retrieval]
            similarity_weight = 0.5
            eligible_statuses = ["indexed"]

            [ingest]
            enrichment_retry = "next_poll"
            max_enrichment_attempts = 5
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.retrieval.similarity_weight, 0.5);
        assert_eq!(config.retrieval.eligible_statuses, vec![ItemStatus::Indexed]);
        assert_eq!(config.ingest.enrichment_retry, EnrichmentRetry::NextPoll);
        assert_eq!(config.ingest.max_enrichment_attempts, 5);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../config/cap.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7410");
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        let mut config = Config::minimal("cap.sqlite");
        config.retrieval.text_weight = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rrf_k_bounds_fused_score() {
        let mut config = Config::minimal("cap.sqlite");
        config.retrieval.rrf_k = 0.5;
        assert!(validate(&config).is_err());

        config.retrieval.rrf_k = 1.0;
        config.retrieval.text_weight = 1.0;
        config.retrieval.vector_weight = 1.0;
        validate(&config).unwrap();
        let r = &config.retrieval;
        assert!((r.text_weight + r.vector_weight) / (r.rrf_k + 1.0) <= 1.0);
    }

    #[test]
    fn test_rejects_failed_as_eligible() {
        let mut config = Config::minimal("cap.sqlite");
        config.retrieval.eligible_statuses = vec![ItemStatus::Processed, ItemStatus::Failed];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_unknown_providers() {
        let mut config = Config::minimal("cap.sqlite");
        config.enrichment.provider = "gpt".into();
        assert!(validate(&config).is_err());

        let mut config = Config::minimal("cap.sqlite");
        config.embedding.provider = "openai".into();
        assert!(validate(&config).is_err(), "openai requires model and dims");
    }
}
