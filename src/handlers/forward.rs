use axum::{Json, extract::State, http::HeaderMap};
use reqwest::Method;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::error::{GatewayError, UpstreamError};
use crate::governor::LimitOptions;
use crate::inbound::client_key;
use crate::metrics::{GATEWAY_LATENCY, GATEWAY_REQUESTS};
use crate::retry::RetryOptions;
use crate::state::AppState;
use crate::upstream::{ForwardRequest, UpstreamResponse, join_url, send};

pub async fn forward_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ForwardRequest>,
) -> Result<Json<UpstreamResponse>, GatewayError> {
    GATEWAY_REQUESTS.inc();

    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if !state.inbound.check(&client_key(api_key)) {
        return Err(GatewayError::RateLimited);
    }

    let method = match payload.method.as_deref() {
        Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::BadRequest(format!("unknown method {m}")))?,
        None => Method::GET,
    };

    let start_time = Instant::now();

    let client = state.client.clone();
    let url = join_url(&state.upstream, &payload.path);
    let body = payload.body.clone();
    let call = move || send(client.clone(), url.clone(), method.clone(), body.clone());

    // Coalesced calls run once; the rest go through backoff retry
    let result = if payload.deduplicate {
        state
            .governor
            .execute_with_limit(&payload.key, call, LimitOptions::deduplicated())
            .await
    } else {
        let key = payload.key.clone();
        let options = RetryOptions::new().on_retry(move |retry, delay, err: &UpstreamError| {
            warn!(key = %key, retry, ?delay, error = %err, "upstream call failed, retrying");
        });
        state
            .governor
            .execute_with_retry(&payload.key, call, options)
            .await
    };

    GATEWAY_LATENCY.observe(start_time.elapsed().as_secs_f64());

    Ok(Json(result?))
}
