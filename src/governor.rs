use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigPatch, ConfigRegistry, RateLimitConfig};
use crate::dedup::{Claim, Deduplicator};
use crate::housekeeper::{Housekeeper, MAX_IDLE_AGE, SWEEP_INTERVAL};
use crate::metrics::{DEDUP_JOINS, RETRIES_TOTAL};
use crate::rate_limit::{Admission, RateLimitStatus, RateLimiter};
use crate::retry::{RetryOptions, Retryable, backoff_delay};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOptions {
    /// Share one in-flight execution among concurrent callers of the same key.
    pub deduplicate: bool,
}

impl LimitOptions {
    pub fn deduplicated() -> Self {
        Self { deduplicate: true }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    registry: Arc<ConfigRegistry>,
    limiter: Arc<RateLimiter>,
    dedup: Deduplicator,
}

/// Rate limiting, request coalescing and retry for outbound calls.
///
/// Cheap to clone; clones share state. Separate `Governor::new()` calls
/// give fully isolated instances.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_registry(clock, Arc::new(ConfigRegistry::new()))
    }

    pub fn with_registry(clock: Arc<dyn Clock>, registry: Arc<ConfigRegistry>) -> Self {
        let limiter = Arc::new(RateLimiter::new(registry.clone(), clock.clone()));
        Self {
            inner: Arc::new(Inner {
                clock,
                registry,
                limiter,
                dedup: Deduplicator::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.inner.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn config_for(&self, key: &str) -> RateLimitConfig {
        self.inner.registry.resolve(key)
    }

    pub fn can_request(&self, key: &str) -> Admission {
        self.inner.limiter.can_request(key)
    }

    pub fn record_request(&self, key: &str) {
        self.inner.limiter.record_request(key)
    }

    pub async fn wait_for_slot(&self, key: &str) {
        self.inner.limiter.wait_for_slot(key).await
    }

    pub fn get_status(&self, key: &str) -> RateLimitStatus {
        self.inner.limiter.status(key)
    }

    pub fn set_config(&self, prefix: &str, patch: &ConfigPatch) -> RateLimitConfig {
        self.inner.registry.set(prefix, patch)
    }

    pub fn reset(&self, key: &str) {
        self.inner.limiter.reset(key)
    }

    pub fn reset_all(&self) {
        self.inner.limiter.reset_all()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.dedup.is_pending(key)
    }

    // slot, record, call
    async fn run<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.wait_for_slot(key).await;
        self.record_request(key);
        f().await
    }

    /// Runs `f` once a rate limit slot is free.
    ///
    /// With `deduplicate`, a caller arriving while the same key is already
    /// in flight gets that call's outcome instead of running `f`. The
    /// shared call is spawned onto the runtime, so it finishes and
    /// delivers to the remaining callers even if the caller that started
    /// it goes away. Errors from `f` come back untouched.
    pub async fn execute_with_limit<F, Fut, T, E>(
        &self,
        key: &str,
        f: F,
        options: LimitOptions,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        if !options.deduplicate {
            return self.run(key, f).await;
        }

        loop {
            match self.inner.dedup.claim::<T, E>(key) {
                Claim::Join(mut outcome) => {
                    DEDUP_JOINS.inc();
                    debug!(key, "joining in-flight request");
                    let settled = match outcome.wait_for(Option::is_some).await {
                        Ok(result) => (*result).clone(),
                        Err(_) => None,
                    };
                    if let Some(result) = settled {
                        return result;
                    }
                    // leader panicked before settling; the entry is gone, claim again
                }
                Claim::Bypass => {
                    debug!(key, "in-flight request has another result type, not coalescing");
                    return self.run(key, f).await;
                }
                Claim::Lead(guard) => {
                    // taken by the task once it has a slot; left behind if the
                    // task is cancelled while still waiting
                    let call = Arc::new(Mutex::new(Some(f)));
                    let pending_call = Arc::clone(&call);
                    let governor = self.clone();
                    let owned_key = key.to_string();
                    let task = tokio::spawn(async move {
                        governor.wait_for_slot(&owned_key).await;
                        let Some(f) = take_call(&pending_call) else {
                            return None;
                        };
                        governor.record_request(&owned_key);
                        Some(guard.settle(f().await))
                    });

                    match task.await {
                        Ok(Some(result)) => return result,
                        Ok(None) => {}
                        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                        Err(err) => warn!(key, error = %err, "in-flight request was cancelled"),
                    }

                    // The runtime dropped the task before it settled; its guard
                    // has cleared the entry. Run here if the call never started.
                    let Some(f) = take_call(&call) else {
                        panic!("in-flight request for {key} was torn down mid-call");
                    };
                    return self.run(key, f).await;
                }
            }
        }
    }

    /// Calls `f` through [`execute_with_limit`](Self::execute_with_limit) up to
    /// `max_retries` times in total, sleeping `base_retry_delay * 2^n` between
    /// attempts.
    ///
    /// Stops at the first success, at a failure the classifier rejects, or
    /// after the last attempt. The returned error is always the one `f`
    /// produced on the final attempt.
    ///
    /// `E` must implement [`Retryable`] even when `options` carries its own
    /// `should_retry`; the trait then only serves as the fallback classifier
    /// and an empty `impl Retryable for MyError {}` is enough.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        key: &str,
        f: F,
        options: RetryOptions<E>,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Retryable + Clone + Send + Sync + 'static,
    {
        let config = self.config_for(key);
        let attempts = config.max_retries.max(1);
        let f = Arc::new(f);
        let mut attempt = 0;

        loop {
            let call = Arc::clone(&f);
            let error = match self
                .execute_with_limit(key, move || call(), LimitOptions::default())
                .await
            {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let retry = options.is_retryable(&error);
            if !retry || attempt + 1 >= attempts {
                debug!(key, attempt = attempt + 1, retry, "giving up");
                return Err(error);
            }

            let delay = backoff_delay(config.base_retry_delay(), attempt);
            RETRIES_TOTAL.inc();
            warn!(key, retry = attempt + 1, ?delay, "request failed, backing off");
            options.notify(attempt + 1, delay, &error);
            drop(error);

            self.inner.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    /// Starts the idle-entry sweep (every 60s, 5 minute max age).
    pub fn start_housekeeper(&self) -> Housekeeper {
        self.start_housekeeper_with(SWEEP_INTERVAL, MAX_IDLE_AGE)
    }

    pub fn start_housekeeper_with(&self, period: Duration, max_age: Duration) -> Housekeeper {
        Housekeeper::spawn(Arc::downgrade(&self.inner.limiter), period, max_age)
    }
}

fn take_call<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    match slot.lock() {
        Ok(mut call) => call.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}
