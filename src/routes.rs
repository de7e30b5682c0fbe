use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::stats::{CacheStatsSnapshot, LimiterStatsSnapshot};

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub cache: CacheStatsSnapshot,
    pub rate_limiter: LimiterStatsSnapshot,
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok").into_response()
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatsReport {
        cache: state.cache.stats_snapshot(),
        rate_limiter: state
            .limiter_stats
            .snapshot(state.limiter.tracked_identifiers()),
    })
}
