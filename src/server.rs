//! HTTP server.
//!
//! Exposes retrieval and on-demand ingestion as a small JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Hybrid, recent, or tag search |
//! | `GET`  | `/feeds` | List subscribed feeds |
//! | `POST` | `/feeds/{id}/ingest` | Run ingestion for one feed now |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "limit must be >= 1" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `upstream_error` (502), `backend_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::{IngestError, SearchError};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::models::{Corpus, Feed, SearchResult};
use crate::search::{SearchEngine, SearchRequest};
use crate::store::{SqliteStore, Store};

/// Upper bound on `limit` accepted by `POST /search`.
const MAX_LIMIT: usize = 100;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    engine: Arc<SearchEngine>,
    pipeline: Arc<IngestPipeline>,
    search_timeout: Duration,
    ingest_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<SearchEngine>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            store,
            engine,
            pipeline,
            search_timeout: Duration::from_secs(30),
            ingest_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeouts(mut self, search: Duration, ingest: Duration) -> Self {
        self.search_timeout = search;
        self.ingest_timeout = ingest;
        self
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/feeds", get(handle_list_feeds))
        .route("/feeds/{id}/ingest", post(handle_ingest))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind`. Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let engine = Arc::new(SearchEngine::new(
        store.clone(),
        create_embedder(&config.embedding)?,
        config.retrieval.clone(),
    ));
    let pipeline = Arc::new(IngestPipeline::from_config(config, store.clone())?);
    let state = AppState::new(store, engine, pipeline).with_timeouts(
        Duration::from_secs(30),
        Duration::from_secs(config.scheduler.run_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("Listening on http://{}", config.server.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    pool.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::FeedNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            IngestError::TransientNetwork { .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
            }
            IngestError::BackendUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", message)
            }
            IngestError::Cancelled => timeout_error(message),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    #[serde(default)]
    query: String,
    #[serde(default)]
    tags: Vec<String>,
    limit: Option<usize>,
    #[serde(default)]
    corpus: Corpus,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let limit = body.limit.unwrap_or(state.engine.config().default_limit);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(bad_request(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    let tags: Vec<String> = body
        .tags
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .collect();

    let request = SearchRequest {
        query: body.query,
        tags,
        limit,
        corpus: body.corpus,
    };

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let results = match tokio::time::timeout(
        state.search_timeout,
        state.engine.search(&request, &cancel),
    )
    .await
    {
        Ok(Ok(results)) => results,
        Ok(Err(SearchError::Cancelled)) | Err(_) => {
            return Err(timeout_error("search timed out"));
        }
    };

    Ok(Json(SearchResponse { results }))
}

// ============ GET /feeds ============

#[derive(Serialize)]
struct FeedListResponse {
    feeds: Vec<Feed>,
}

async fn handle_list_feeds(
    State(state): State<AppState>,
) -> Result<Json<FeedListResponse>, AppError> {
    let feeds = state
        .store
        .list_feeds(false)
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(FeedListResponse { feeds }))
}

// ============ POST /feeds/{id}/ingest ============

async fn handle_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IngestReport>, AppError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    match tokio::time::timeout(state.ingest_timeout, state.pipeline.ingest(&id, &cancel)).await {
        Ok(result) => Ok(Json(result?)),
        Err(_) => Err(timeout_error("ingestion timed out")),
    }
}
