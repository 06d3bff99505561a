use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;
use tracing::info;

use crate::config::{ConfigPatch, RateLimitConfig};
use crate::rate_limit::RateLimitStatus;
use crate::state::AppState;

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<RateLimitStatus> {
    Json(state.governor.get_status(&key))
}

pub async fn set_config_handler(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Json(patch): Json<ConfigPatch>,
) -> Json<RateLimitConfig> {
    let config = state.governor.set_config(&prefix, &patch);
    info!(prefix = %prefix, ?config, "limit config replaced");
    Json(config)
}

pub async fn reset_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> StatusCode {
    state.governor.reset(&key);
    StatusCode::NO_CONTENT
}

pub async fn reset_all_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.governor.reset_all();
    info!("all rate limit entries cleared");
    StatusCode::NO_CONTENT
}
