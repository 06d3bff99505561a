//! Client-side request governance: per-key rate limiting, coalescing of
//! concurrent identical calls, and bounded exponential-backoff retry.
//!
//! ```no_run
//! use request_governor::{Governor, RetryOptions, UpstreamError};
//!
//! # async fn demo() -> Result<(), UpstreamError> {
//! let governor = Governor::new();
//! let _housekeeper = governor.start_housekeeper();
//!
//! let body = governor
//!     .execute_with_retry(
//!         "ndvi:health",
//!         || async { Ok::<_, UpstreamError>("ok".to_string()) },
//!         RetryOptions::new(),
//!     )
//!     .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod governor;
pub mod handlers;
pub mod housekeeper;
pub mod inbound;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod state;
pub mod upstream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigPatch, ConfigRegistry, DEFAULT_PREFIX, RateLimitConfig};
pub use error::{GatewayError, GovernorError, UpstreamError};
pub use governor::{Governor, LimitOptions};
pub use housekeeper::Housekeeper;
pub use rate_limit::{Admission, RateLimitEntry, RateLimitStatus, RateLimiter};
pub use retry::{RetryOptions, Retryable, backoff_delay, default_is_retryable};
