use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram};


lazy_static! {
    pub static ref ADMITTED_TOTAL: Counter =
        register_counter!("governor_admitted_total", "Requests recorded against a rate limit window").unwrap();
    pub static ref DENIED_TOTAL: Counter =
        register_counter!("governor_denied_total", "Admission checks that found no free slot").unwrap();
    pub static ref DEDUP_JOINS: Counter =
        register_counter!("governor_dedup_joins_total", "Callers coalesced onto an in-flight request").unwrap();
    pub static ref RETRIES_TOTAL: Counter =
        register_counter!("governor_retries_total", "Backoff retries scheduled").unwrap();
    pub static ref EVICTED_TOTAL: Counter =
        register_counter!("governor_evicted_total", "Idle rate limit entries removed by the housekeeper").unwrap();
    pub static ref TRACKED_KEYS: Gauge =
        register_gauge!("governor_tracked_keys", "Current number of rate limit entries").unwrap();
    pub static ref GATEWAY_REQUESTS: Counter =
        register_counter!("governor_gateway_requests_total", "Requests received by the gateway").unwrap();
    pub static ref GATEWAY_LATENCY: Histogram = register_histogram!(
        "governor_gateway_latency_seconds",
        "Forwarded request latency in seconds"
    )
    .unwrap();
}
