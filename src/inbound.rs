//! Fixed-window quota for callers of the gateway itself.
//!
//! Independent of the outbound [`RateLimiter`](crate::RateLimiter): one
//! counter per hashed API key, no spacing, no waiting.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval};
use tracing::debug;

// Inbound entry - tracks requests per API key
struct InboundEntry {
    count: u32,
    window_start: Instant,
}

pub struct InboundLimiter {
    entries: DashMap<String, InboundEntry>,
    limit: u32,       // max requests allowed
    window: Duration, // duration of the window
}

// Key callers by a hash so raw API keys never sit in memory
pub fn client_key(api_key: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.unwrap_or("anonymous"));
    format!("{:x}", hasher.finalize())
}

impl InboundLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
            window,
        }
    }

    /// Counts one request for `client`; `false` once its quota is spent.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(client.to_string())
            .or_insert(InboundEntry {
                count: 0,
                window_start: now,
            });

        // window expired..? Reset it
        if now.duration_since(entry.window_start) > self.window {
            entry.count = 1;
            entry.window_start = now;
            return true;
        }

        // under limit.? Allow
        if entry.count < self.limit {
            entry.count += 1;
            return true;
        }

        debug!(client, "inbound quota exhausted");
        false
    }

    /// Removes entries whose window is over.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) <= self.window);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Cleanup loop for the inbound limiter, runs for the life of the server
pub async fn inbound_sweeper(limiter: Arc<InboundLimiter>, every: Duration) {
    let mut ticker = interval(every.max(Duration::from_millis(1)));

    loop {
        ticker.tick().await;
        let removed = limiter.cleanup();
        if removed > 0 {
            debug!(removed, "expired inbound windows removed");
        }
    }
}
