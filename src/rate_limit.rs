use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use prometheus::Gauge;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{ConfigRegistry, RateLimitConfig};
use crate::metrics::{ADMITTED_TOTAL, DENIED_TOTAL, EVICTED_TOTAL, TRACKED_KEYS};

// Rate limit entry - tracks requests per key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: u64,
    pub last_request: Option<u64>, // None until the first recorded request
}

/// Answer to "may this key issue a request now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Admission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
        }
    }

    pub fn denied(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub total: u32,
    pub reset_at: u64,
}

/// Per-key window counter plus minimum spacing between requests.
///
/// Windows reset lazily: any access that finds `now - window_start >= window_ms`
/// zeroes the count and restarts the window before doing anything else.
///
/// The tracked-keys gauge is moved by deltas, so limiters sharing one gauge
/// add up instead of overwriting each other.
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    registry: Arc<ConfigRegistry>,
    clock: Arc<dyn Clock>,
    tracked: Gauge,
}

impl RateLimiter {
    pub fn new(registry: Arc<ConfigRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            registry,
            clock,
            tracked: TRACKED_KEYS.clone(),
        }
    }

    /// Reports the entry count to `gauge` instead of the global one.
    pub fn with_tracked_gauge(mut self, gauge: Gauge) -> Self {
        self.tracked = gauge;
        self
    }

    // get-or-create, then expire the window if it is over
    fn entry(&self, key: &str, config: &RateLimitConfig, now: u64) -> RefMut<'_, String, RateLimitEntry> {
        let mut created = false;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                RateLimitEntry {
                    count: 0,
                    window_start: now,
                    last_request: None,
                }
            });
        if created {
            self.tracked.inc();
        }

        if now.saturating_sub(entry.window_start) >= config.window_ms {
            entry.count = 0;
            entry.window_start = now;
        }
        entry
    }

    pub fn can_request(&self, key: &str) -> Admission {
        let config = self.registry.resolve(key);
        let now = self.clock.now_ms();
        let entry = self.entry(key, &config, now);

        if entry.count >= config.max_requests {
            let elapsed = now.saturating_sub(entry.window_start);
            let retry_after = config.window_ms.saturating_sub(elapsed);
            DENIED_TOTAL.inc();
            debug!(key, count = entry.count, retry_after, "window saturated");
            return Admission::denied(retry_after);
        }

        if let Some(last) = entry.last_request {
            let since_last = now.saturating_sub(last);
            if since_last < config.min_interval_ms {
                let retry_after = config.min_interval_ms - since_last;
                DENIED_TOTAL.inc();
                debug!(key, retry_after, "minimum spacing not reached");
                return Admission::denied(retry_after);
            }
        }

        Admission::allowed()
    }

    pub fn record_request(&self, key: &str) {
        let config = self.registry.resolve(key);
        let now = self.clock.now_ms();
        {
            let mut entry = self.entry(key, &config, now);
            entry.count = entry.count.saturating_add(1);
            entry.last_request = Some(now);
        }
        ADMITTED_TOTAL.inc();
    }

    pub fn status(&self, key: &str) -> RateLimitStatus {
        let config = self.registry.resolve(key);
        let now = self.clock.now_ms();
        let entry = self.entry(key, &config, now);

        RateLimitStatus {
            remaining: config.max_requests.saturating_sub(entry.count),
            total: config.max_requests,
            reset_at: entry.window_start.saturating_add(config.window_ms),
        }
    }

    /// Sleeps once for the reported `retry_after`, if any.
    ///
    /// Slots are not reserved, so another caller may take the slot first.
    pub async fn wait_for_slot(&self, key: &str) {
        let admission = self.can_request(key);
        if admission.allowed {
            return;
        }
        if let Some(delay) = admission.retry_after().filter(|d| !d.is_zero()) {
            debug!(key, ?delay, "waiting for rate limit slot");
            self.clock.sleep(delay).await;
        }
    }

    /// Drops every entry whose window started more than `max_age` ago.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_age = max_age.as_millis() as u64;
        let mut evicted = 0usize;

        self.entries.retain(|_, entry| {
            let keep = now.saturating_sub(entry.window_start) <= max_age;
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            EVICTED_TOTAL.inc_by(evicted as f64);
            self.tracked.sub(evicted as f64);
            debug!(evicted, "evicted idle rate limit entries");
        }
        evicted
    }

    /// Raw entry, without touching the window.
    pub fn peek(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn reset(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.tracked.dec();
        }
    }

    pub fn reset_all(&self) {
        let mut removed = 0usize;
        self.entries.retain(|_, _| {
            removed += 1;
            false
        });
        self.tracked.sub(removed as f64);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
