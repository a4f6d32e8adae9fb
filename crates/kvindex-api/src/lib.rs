//! The HTTP surface: `/score`, `/healthz`, `/readyz`, `/metrics`,
//! `/admin/stats`, built on the usual axum `AppState`-plus-`Router`
//! wiring around a shared [`Indexer`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kvindex_core::Indexer;

#[derive(Clone)]
pub struct AppState {
    indexer: Arc<Indexer>,
}

/// Builds the router around an already-constructed [`Indexer`], starting
/// the process metrics poller and, if configured, the periodic metrics
/// logger.
pub fn app(indexer: Arc<Indexer>) -> Router {
    kvindex_obs::init();
    kvindex_obs::spawn_process_metrics_polling();
    if let Some(interval) = indexer.config().kv_block_index_config.metrics_logging_interval {
        kvindex_obs::spawn_metrics_logger(interval);
    }
    let state = AppState { indexer };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/score", post(score))
        .route("/admin/stats", get(admin_stats))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(_state): State<AppState>) -> impl IntoResponse {
    ([("content-type", "text/plain")], "ready")
}

async fn metrics() -> impl IntoResponse {
    let buf = kvindex_obs::render();
    ([("content-type", "text/plain; version=0.0.4")], buf)
}

#[derive(serde::Deserialize)]
struct ScoreRequest {
    prompt: String,
    model: String,
    #[serde(default)]
    allowed_pods: Vec<String>,
}

#[derive(serde::Serialize)]
struct ScoreResponse {
    scores: HashMap<String, i64>,
}

async fn score(State(state): State<AppState>, Json(req): Json<ScoreRequest>) -> impl IntoResponse {
    tracing::debug!(target: "api", model = %req.model, "score request");
    match state
        .indexer
        .score(&req.prompt, &req.model, &req.allowed_pods)
        .await
    {
        Ok(scores) => Json(ScoreResponse { scores }).into_response(),
        Err(e) => {
            tracing::warn!(target: "api", error = %e, "score backend call failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct AdminStats {
    prefix_store_cache_size: usize,
    token_block_size: usize,
    tokenizer_workers: usize,
    event_pool_concurrency: usize,
}

async fn admin_stats(State(state): State<AppState>) -> Json<AdminStats> {
    let config = state.indexer.config();
    Json(AdminStats {
        prefix_store_cache_size: config.prefix_store_config.cache_size,
        token_block_size: config.token_processor_config.block_size,
        tokenizer_workers: config.tokenizers_pool_config.workers_count,
        event_pool_concurrency: config.event_pool.concurrency,
    })
}
