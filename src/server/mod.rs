//! HTTP surface
//!
//! Thin axum layer over [`QueryEngine`] and [`StatsSampler`]. Handlers are plain async
//! functions so they can be exercised without a listener.


use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::search::{
    DEFAULT_MAX_RESULTS, QueryEngine, QueryError, QueryMatch, QueryRequest, SimpleQueryResponse,
};
use crate::stats::{CollectionStats, StatsSampler};

pub const SERVICE_NAME: &str = "chat-recall";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub stats_sample_cap: usize,
}

impl AppState {
    #[inline]
    pub fn new(engine: Arc<QueryEngine>, stats_sample_cap: usize) -> Self {
        Self {
            engine,
            stats_sample_cap,
        }
    }
}

/// Error response: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn code(&self) -> &'static str {
        self.code
    }

    fn unavailable(code: &'static str, message: String) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code,
            message,
        }
    }
}

impl From<QueryError> for ApiError {
    #[inline]
    fn from(error: QueryError) -> Self {
        let status = match error {
            QueryError::EmptyQuestion | QueryError::InvalidMaxResults(_) => {
                StatusCode::BAD_REQUEST
            }
            QueryError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Upstream(_) => StatusCode::BAD_GATEWAY,
            QueryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        Self {
            status,
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    #[inline]
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub question: String,
    pub records: Vec<QueryMatch>,
    pub total_found: usize,
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub collection: String,
    #[serde(flatten)]
    pub stats: CollectionStats,
}

const fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

#[derive(Debug, Deserialize)]
pub struct SimpleParams {
    #[serde(default)]
    pub question: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[inline]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/query", post(query))
        .route("/query_simple", post(query_simple))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
#[inline]
pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down"),
        Err(e) => {
            warn!("Could not install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[inline]
pub async fn root(State(state): State<AppState>) -> Json<Value> {
    let context = state.engine.context();
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "collection": context.collection(),
        "index_loaded": context.is_loaded(),
        "status": if context.is_loaded() { "running" } else { "index not loaded" },
        "endpoints": {
            "query": "POST /query",
            "query_simple": "POST /query_simple?question=..&max_results=5",
            "health": "GET /health",
            "stats": "GET /stats"
        }
    }))
}

/// Probe query against the loaded index.
#[inline]
pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.engine.probe().await {
        Ok(found) => Ok(Json(json!({
            "status": "healthy",
            "index": "connected",
            "probe_results": found
        }))),
        Err(e) => {
            warn!("Health probe failed: {}", e);
            Err(ApiError::unavailable(e.code(), e.to_string()))
        }
    }
}

#[inline]
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let context = state.engine.context();
    let index = context.index().ok_or_else(|| {
        ApiError::from(QueryError::IndexUnavailable(
            context
                .unavailable_reason()
                .unwrap_or("index not initialized")
                .to_string(),
        ))
    })?;

    let stats = StatsSampler::new(Arc::clone(index), state.stats_sample_cap)
        .stats()
        .await
        .map_err(|e| {
            error!("Stats sampling failed: {}", e);
            ApiError::from(QueryError::Upstream(e.to_string()))
        })?;

    Ok(Json(StatsResponse {
        collection: context.collection().to_string(),
        stats,
    }))
}

#[inline]
pub async fn query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_input",
        message: rejection.body_text(),
    })?;

    let result = state.engine.query(&request).await?;
    info!(
        "Query {:?} returned {} records",
        result.question, result.total_found
    );
    Ok(Json(QueryResponse {
        message: format!("找到 {} 条相关记录", result.total_found),
        question: result.question,
        records: result.records,
        total_found: result.total_found,
        status: "success",
    }))
}

/// Lenient endpoint: always 200, failures are reported in the body.
#[inline]
pub async fn query_simple(
    State(state): State<AppState>,
    params: Result<Query<SimpleParams>, QueryRejection>,
) -> Json<SimpleQueryResponse> {
    match params {
        Ok(Query(params)) => Json(
            state
                .engine
                .query_simple(&params.question, params.max_results)
                .await,
        ),
        Err(rejection) => Json(SimpleQueryResponse::Failed {
            error: rejection.body_text(),
        }),
    }
}
