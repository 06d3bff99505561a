use std::sync::Arc;

use crate::governor::Governor;
use crate::inbound::InboundLimiter;

// app's shared state
pub struct AppState {
    pub client: reqwest::Client,
    pub upstream: String,              // base URL of the protected API
    pub governor: Governor,            // outbound limits, dedup, retry
    pub inbound: Arc<InboundLimiter>,  // per-API-key quota for our own callers
}
