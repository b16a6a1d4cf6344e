//! HTTP API server.
//!
//! Exposes the query engine over a small JSON API:
//!
//! - `POST /query` — stateless question answering
//! - `POST /navigate` — session-aware question answering
//! - `POST /ingest/text` — ingest raw text
//! - `GET /collections` — knowledge-base statistics
//! - `DELETE /documents/{id}` — remove a document and its graph entries
//! - `DELETE /sessions/{id}` — close a session
//! - `GET /health` — liveness probe
//!
//! Errors are returned as `{"error": {"code": ..., "message": ...}}` with
//! a status code derived from the error taxonomy.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::{QueryEngine, QueryOptions};
use crate::error::RecallError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
}

/// Interval between background sweeps of expired sessions.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Run the HTTP server until shutdown.
pub async fn serve(engine: QueryEngine, bind: &str) -> anyhow::Result<()> {
    let state = AppState {
        engine: Arc::new(engine),
    };

    // Expired sessions are also checked lazily on access; the sweep just
    // keeps the table from accumulating dead rows
    let sweeper = state.engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sessions().sweep_expired().await {
                tracing::warn!(error = %e, "session sweep failed");
            }
        }
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(handle_query))
        .route("/navigate", post(handle_navigate))
        .route("/ingest/text", post(handle_ingest_text))
        .route("/collections", get(handle_collections))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/sessions/{id}", delete(handle_close_session))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============ Request/response types ============

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NavigateRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IngestTextRequest {
    text: String,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "api".to_string()
}

// ============ Error mapping ============

struct ApiError(StatusCode, String);

impl ApiError {
    fn from_recall(err: RecallError) -> Self {
        let status = match &err {
            RecallError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            // The engine turns this into a no-knowledge response before
            // it can reach a handler; mapped anyway for completeness
            RecallError::EmptyIndex => StatusCode::NOT_FOUND,
            RecallError::Embedding(_) | RecallError::Synthesis(_) => StatusCode::BAD_GATEWAY,
            RecallError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

impl From<RecallError> for ApiError {
    fn from(err: RecallError) -> Self {
        Self::from_recall(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.as_u16();
        let body = json!({ "error": { "code": code, "message": self.1 } });
        (self.0, Json(body)).into_response()
    }
}

// ============ Handlers ============

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let opts = QueryOptions {
        k: req.k,
        doc_filter: req.document_id,
        timeout: req.timeout_secs.map(Duration::from_secs),
    };
    let response = state.engine.query(&req.question, &opts).await?;
    Ok(Json(response))
}

async fn handle_navigate(
    State(state): State<AppState>,
    Json(req): Json<NavigateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let opts = QueryOptions {
        k: req.k,
        doc_filter: None,
        timeout: req.timeout_secs.map(Duration::from_secs),
    };
    let response = state
        .engine
        .navigate(&req.question, req.session_id.as_deref(), &opts)
        .await?;
    Ok(Json(response))
}

async fn handle_ingest_text(
    State(state): State<AppState>,
    Json(req): Json<IngestTextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.engine.ingest_text(&req.text, &req.source).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn handle_collections(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.engine.stats().await?;
    Ok(Json(stats))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.engine.delete_document(&id).await?;
    if removed == 0 {
        return Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("No document with id '{}'", id),
        ));
    }
    Ok(Json(json!({ "document_id": id, "fragments_removed": removed })))
}

async fn handle_close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.sessions().close(&id).await?;
    Ok(Json(json!({ "session_id": id, "closed": true })))
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
