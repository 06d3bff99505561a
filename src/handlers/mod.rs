mod forward;
mod health;
mod limits;
mod metrics;

use axum::{
    Router,
    routing::{delete, get, post, put},
};
use std::sync::Arc;

use crate::state::AppState;

pub use forward::forward_handler;
pub use health::health_handler;
pub use limits::{reset_all_handler, reset_handler, set_config_handler, status_handler};
pub use metrics::metrics_handler;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status/{key}", get(status_handler))
        .route("/config/{prefix}", put(set_config_handler))
        .route("/limits", delete(reset_all_handler))
        .route("/limits/{key}", delete(reset_handler))
        .route("/api/forward", post(forward_handler))
        .with_state(state)
}
