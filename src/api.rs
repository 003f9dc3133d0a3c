use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::ingest::scheduler::{Scheduler, SchedulerStats};
use crate::models::Article;
use crate::ratelimit::middleware::{rate_limit, ClientKey};
use crate::ratelimit::{RateLimiter, UsageStats};
use crate::storage::Storage;
use crate::translate::worker::{TranslationWorker, WorkerStats};

const DEFAULT_NEWS_LIMIT: usize = 50;
const MAX_NEWS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub limiter: Arc<RateLimiter>,
    pub scheduler: Option<Arc<Scheduler>>,
    pub translator: Option<Arc<TranslationWorker>>,
}

/// Single boundary where internal failures become a generic response.
#[derive(Debug)]
pub enum ApiError {
    Unavailable,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        (status, Json(serde_json::json!({ "error": code }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/api/status", get(status))
        .route("/api/usage", get(usage))
        .route("/api/news", get(news))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit,
        ));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(limited)
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct SourceHealth {
    id: i64,
    key: String,
    name: String,
    enabled: bool,
    healthy: bool,
    error_count: u32,
    needs_backoff: bool,
    backoff_secs: u64,
    last_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct TranslationStatusView {
    enabled: bool,
    stats: Option<WorkerStats>,
}

#[derive(Serialize)]
struct StatusResp {
    scheduler: Option<SchedulerStats>,
    next_fetch_in_secs: u64,
    translation: TranslationStatusView,
    sources: Vec<SourceHealth>,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResp>, ApiError> {
    let sources = state.storage.list_sources().await.map_err(|e| {
        tracing::error!(error = %e, "status: listing sources failed");
        ApiError::Internal
    })?;

    let sources = sources
        .into_iter()
        .map(|s| SourceHealth {
            healthy: s.is_healthy(),
            needs_backoff: s.needs_backoff(),
            backoff_secs: s.backoff_duration().as_secs(),
            id: s.id,
            key: s.key,
            name: s.name,
            enabled: s.enabled,
            error_count: s.error_count,
            last_fetched_at: s.last_fetched_at,
        })
        .collect();

    Ok(Json(StatusResp {
        scheduler: state.scheduler.as_ref().map(|s| s.stats()),
        next_fetch_in_secs: state
            .scheduler
            .as_ref()
            .map(|s| s.next_fetch_in().as_secs())
            .unwrap_or(0),
        translation: TranslationStatusView {
            enabled: state.translator.is_some(),
            stats: state.translator.as_ref().map(|t| t.stats()),
        },
        sources,
    }))
}

async fn usage(
    State(state): State<AppState>,
    Extension(client): Extension<ClientKey>,
) -> Result<Json<UsageStats>, ApiError> {
    state
        .limiter
        .usage(&client.identifier, client.tier)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(target: "ratelimit", error = %e, "usage lookup failed");
            ApiError::Unavailable
        })
}

#[derive(Deserialize)]
struct NewsQuery {
    limit: Option<usize>,
}

async fn news(
    State(state): State<AppState>,
    Query(q): Query<NewsQuery>,
) -> Result<Json<Vec<Article>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_NEWS_LIMIT).clamp(1, MAX_NEWS_LIMIT);
    state
        .storage
        .recent_articles(limit)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(error = %e, "news: loading articles failed");
            ApiError::Internal
        })
}
