//! Retry classification and backoff.
//!
//! The retry loop itself lives on [`Governor::execute_with_retry`](crate::Governor::execute_with_retry);
//! this module holds the pieces it is parameterised by.

use std::fmt;
use std::time::Duration;

/// HTTP statuses worth retrying: rate limited, unavailable, gateway timeout.
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 503, 504];

/// What the default classifier needs to know about an error.
///
/// Both methods default to "no", so an error type with nothing transient
/// about it can opt in with an empty `impl Retryable for MyError {}`.
pub trait Retryable {
    /// Network-layer failure: connection refused, reset, DNS, timeout.
    fn is_transport_error(&self) -> bool {
        false
    }

    /// HTTP status carried by the error, if any.
    fn status_code(&self) -> Option<u16> {
        None
    }
}

pub fn default_is_retryable<E: Retryable + ?Sized>(error: &E) -> bool {
    error.is_transport_error()
        || error
            .status_code()
            .is_some_and(|status| RETRYABLE_STATUSES.contains(&status))
}

impl Retryable for reqwest::Error {
    fn is_transport_error(&self) -> bool {
        self.is_connect() || self.is_timeout() || (self.is_request() && self.status().is_none())
    }

    fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }
}

impl Retryable for std::io::Error {
    fn is_transport_error(&self) -> bool {
        true
    }
}

/// `base * 2^attempt` with `attempt` counted from 0. No jitter, no cap.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    match 2u32.checked_pow(attempt) {
        Some(factor) => base.checked_mul(factor).unwrap_or(Duration::MAX),
        None => Duration::MAX,
    }
}

type ShouldRetry<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type OnRetry<E> = Box<dyn Fn(u32, Duration, &E) + Send + Sync>;

/// Per-call hooks for `execute_with_retry`.
pub struct RetryOptions<E> {
    should_retry: Option<ShouldRetry<E>>,
    on_retry: Option<OnRetry<E>>,
}

impl<E> RetryOptions<E> {
    pub fn new() -> Self {
        Self {
            should_retry: None,
            on_retry: None,
        }
    }

    /// Replaces the default classifier.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Box::new(predicate));
        self
    }

    /// Called before each backoff sleep with the 1-based retry number,
    /// the delay about to be slept and the error that caused it.
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, Duration, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(observer));
        self
    }

    pub(crate) fn is_retryable(&self, error: &E) -> bool
    where
        E: Retryable,
    {
        match &self.should_retry {
            Some(predicate) => predicate(error),
            None => default_is_retryable(error),
        }
    }

    pub(crate) fn notify(&self, retry: u32, delay: Duration, error: &E) {
        if let Some(observer) = &self.on_retry {
            observer(retry, delay, error);
        }
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<predicate>"))
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<observer>"))
            .finish()
    }
}
