use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Waker};
use std::time::Duration;

use request_governor::clock::Sleep;
use request_governor::{
    Admission, Clock, ConfigPatch, Governor, LimitOptions, ManualClock, RetryOptions, Retryable,
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FakeError {
    Network,
    Status(u16),
    Validation,
}

impl Retryable for FakeError {
    fn is_transport_error(&self) -> bool {
        matches!(self, FakeError::Network)
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            FakeError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

type BoxedCall = Pin<Box<dyn Future<Output = Result<u32, FakeError>> + Send>>;

fn governor() -> (Governor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    (Governor::with_clock(clock.clone()), clock)
}

// fn that replays `script` in order, then repeats its last entry
fn scripted(
    calls: &Arc<AtomicUsize>,
    script: Vec<Result<u32, FakeError>>,
) -> impl Fn() -> BoxedCall + Clone + Send + Sync + 'static {
    let calls = calls.clone();
    let script = Arc::new(script);
    move || -> BoxedCall {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let outcome = script[n.min(script.len() - 1)].clone();
        Box::pin(async move { outcome })
    }
}

// fn that announces it started, then holds until released
fn gated(
    calls: &Arc<AtomicUsize>,
    started: &Arc<Notify>,
    release: &Arc<Notify>,
    outcome: Result<u32, FakeError>,
) -> impl FnOnce() -> BoxedCall + Send + 'static {
    let calls = calls.clone();
    let started = started.clone();
    let release = release.clone();
    move || -> BoxedCall {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            started.notify_one();
            release.notified().await;
            outcome
        })
    }
}

// Clock whose sleeps hold until `release` is notified
struct HeldClock {
    now: AtomicU64,
    sleeping: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldClock {
    fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
            sleeping: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

impl Clock for HeldClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, _duration: Duration) -> Sleep {
        let sleeping = self.sleeping.clone();
        let release = self.release.clone();
        Box::pin(async move {
            sleeping.notify_one();
            release.notified().await;
        })
    }
}

fn recorder() -> (
    Arc<Mutex<Vec<(u32, Duration, FakeError)>>>,
    impl Fn(u32, Duration, &FakeError) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = move |retry: u32, delay: Duration, err: &FakeError| {
        sink.lock().unwrap().push((retry, delay, err.clone()));
    };
    (seen, observer)
}

#[tokio::test]
async fn auth_key_saturates_after_ten_requests() {
    let (governor, clock) = governor();

    for _ in 0..10 {
        assert!(governor.can_request("auth:login").allowed);
        governor.record_request("auth:login");
        clock.advance(Duration::from_millis(1_000));
    }

    let admission = governor.can_request("auth:login");
    assert!(!admission.allowed);
    let retry_after = admission.retry_after_ms.unwrap();
    assert!(retry_after > 0 && retry_after <= 60_000);
    assert_eq!(retry_after, 50_000);
}

#[tokio::test]
async fn saturated_window_opens_again_after_window_length() {
    let (governor, clock) = governor();
    governor.set_config(
        "tiles",
        &ConfigPatch {
            max_requests: Some(2),
            window_ms: Some(10_000),
            ..Default::default()
        },
    );

    governor.record_request("tiles:z12");
    clock.advance(Duration::from_millis(200));
    governor.record_request("tiles:z12");
    assert!(!governor.can_request("tiles:z12").allowed);

    clock.advance(Duration::from_millis(9_800));
    assert_eq!(governor.can_request("tiles:z12"), Admission::allowed());
    assert_eq!(governor.limiter().peek("tiles:z12").unwrap().count, 0);
}

#[tokio::test]
async fn requests_closer_than_min_interval_are_spaced() {
    let (governor, clock) = governor();
    governor.record_request("ndvi:health");
    clock.advance(Duration::from_millis(100));

    assert_eq!(governor.can_request("ndvi:health"), Admission::denied(400));
}

#[tokio::test]
async fn status_counts_down_and_floors_at_zero() {
    let (governor, clock) = governor();
    let start = clock.now_ms();

    for i in 1..=25u32 {
        governor.record_request("upload:photo");
        let status = governor.get_status("upload:photo");
        assert_eq!(status.remaining, 20u32.saturating_sub(i));
        assert_eq!(status.total, 20);
        assert_eq!(status.reset_at, start + 60_000);
    }
}

#[tokio::test]
async fn sequential_limited_calls_wait_out_the_spacing() {
    let (governor, clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let call = scripted(&calls, vec![Ok(1)]);

    for _ in 0..3 {
        let result = governor
            .execute_with_limit("soil:ph", call.clone(), LimitOptions::default())
            .await;
        assert_eq!(result, Ok(1));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(500), Duration::from_millis(500)]
    );
}

#[tokio::test]
async fn concurrent_deduplicated_calls_share_one_execution() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let first = governor.execute_with_limit(
        "farmers:list",
        gated(&calls, &started, &release, Ok(42)),
        LimitOptions::deduplicated(),
    );
    let second = governor.execute_with_limit(
        "farmers:list",
        gated(&calls, &started, &release, Ok(7)),
        LimitOptions::deduplicated(),
    );

    let (a, b, ()) = tokio::join!(first, second, async { release.notify_one() });

    assert_eq!(a, Ok(42));
    assert_eq!(b, Ok(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!governor.is_in_flight("farmers:list"));
    assert_eq!(governor.get_status("farmers:list").remaining, 99);
}

#[tokio::test]
async fn deduplicated_callers_see_the_same_error() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let first = governor.execute_with_limit(
        "products:list",
        gated(&calls, &started, &release, Err(FakeError::Status(503))),
        LimitOptions::deduplicated(),
    );
    let second = governor.execute_with_limit(
        "products:list",
        gated(&calls, &started, &release, Ok(1)),
        LimitOptions::deduplicated(),
    );

    let (a, b, ()) = tokio::join!(first, second, async { release.notify_one() });

    assert_eq!(a, Err(FakeError::Status(503)));
    assert_eq!(b, Err(FakeError::Status(503)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!governor.is_in_flight("products:list"));
}

#[tokio::test]
async fn abandoned_leader_still_delivers_to_joined_callers() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let leader = tokio::spawn({
        let governor = governor.clone();
        let call = gated(&calls, &started, &release, Ok(9));
        async move {
            governor
                .execute_with_limit("tenant:settings", call, LimitOptions::deduplicated())
                .await
        }
    });
    started.notified().await;
    leader.abort();
    assert!(governor.is_in_flight("tenant:settings"));

    let follower = governor.execute_with_limit(
        "tenant:settings",
        gated(&calls, &started, &release, Ok(0)),
        LimitOptions::deduplicated(),
    );
    let (result, ()) = tokio::join!(follower, async { release.notify_one() });

    assert_eq!(result, Ok(9));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn caller_arriving_during_slot_wait_joins_the_leader() {
    let clock = Arc::new(HeldClock::new(1_700_000_000_000));
    let governor = Governor::with_clock(clock.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    // soil keys need 500ms between requests
    governor.record_request("soil:moisture");

    let leader = tokio::spawn({
        let governor = governor.clone();
        let call = scripted(&calls, vec![Ok(11)]);
        async move {
            governor
                .execute_with_limit("soil:moisture", call, LimitOptions::deduplicated())
                .await
        }
    });
    clock.sleeping.notified().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(governor.is_in_flight("soil:moisture"));

    let follower = governor.execute_with_limit(
        "soil:moisture",
        scripted(&calls, vec![Ok(22)]),
        LimitOptions::deduplicated(),
    );
    let (result, ()) = tokio::join!(follower, async { clock.release.notify_one() });

    assert_eq!(result, Ok(11));
    assert_eq!(leader.await.unwrap(), Ok(11));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(governor.get_status("soil:moisture").remaining, 28);
}

#[test]
fn leader_runs_the_call_itself_when_its_task_is_dropped_unstarted() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut leader = Box::pin(governor.execute_with_limit(
        "weather:today",
        scripted(&calls, vec![Ok(3)]),
        LimitOptions::deduplicated(),
    ));

    // first poll spawns the shared call onto a runtime that never drives it
    let idle = tokio::runtime::Builder::new_current_thread().build().unwrap();
    {
        let _context = idle.enter();
        let mut cx = Context::from_waker(Waker::noop());
        assert!(leader.as_mut().poll(&mut cx).is_pending());
    }
    assert!(governor.is_in_flight("weather:today"));

    // shutting it down cancels the task before it ever ran
    drop(idle);
    assert!(!governor.is_in_flight("weather:today"));

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert_eq!(runtime.block_on(leader), Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn settled_key_runs_again_on_next_call() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let call = scripted(&calls, vec![Ok(1), Ok(2)]);

    let a = governor
        .execute_with_limit("dealers:list", call.clone(), LimitOptions::deduplicated())
        .await;
    let b = governor
        .execute_with_limit("dealers:list", call.clone(), LimitOptions::deduplicated())
        .await;

    assert_eq!((a, b), (Ok(1), Ok(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retryable_failures_stop_after_max_retries() {
    let (governor, clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen, observer) = recorder();

    let result = governor
        .execute_with_retry(
            "farmers:sync",
            scripted(&calls, vec![Err(FakeError::Status(503))]),
            RetryOptions::new().on_retry(observer),
        )
        .await;

    assert_eq!(result, Err(FakeError::Status(503)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
    );
}

#[tokio::test]
async fn non_retryable_error_returns_after_one_call() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen, observer) = recorder();

    let result = governor
        .execute_with_retry(
            "farmers:get",
            scripted(&calls, vec![Err(FakeError::Status(404))]),
            RetryOptions::new().on_retry(observer),
        )
        .await;

    assert_eq!(result, Err(FakeError::Status(404)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn should_retry_overrides_the_default_classifier() {
    let (governor, _clock) = governor();

    let calls = Arc::new(AtomicUsize::new(0));
    let result = governor
        .execute_with_retry(
            "farmers:get",
            scripted(&calls, vec![Err(FakeError::Network)]),
            RetryOptions::new().should_retry(|_: &FakeError| false),
        )
        .await;
    assert_eq!(result, Err(FakeError::Network));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let result = governor
        .execute_with_retry(
            "farmers:get",
            scripted(&calls, vec![Err(FakeError::Validation), Ok(5)]),
            RetryOptions::new().should_retry(|err: &FakeError| *err == FakeError::Validation),
        )
        .await;
    assert_eq!(result, Ok(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backoff_doubles_each_retry() {
    let (governor, _clock) = governor();
    governor.set_config(
        "weather",
        &ConfigPatch {
            max_retries: Some(4),
            base_retry_delay_ms: Some(1_000),
            ..Default::default()
        },
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen, observer) = recorder();

    let result = governor
        .execute_with_retry(
            "weather:forecast",
            scripted(&calls, vec![Err(FakeError::Network)]),
            RetryOptions::new().on_retry(observer),
        )
        .await;

    assert_eq!(result, Err(FakeError::Network));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (1, Duration::from_millis(1_000), FakeError::Network),
            (2, Duration::from_millis(2_000), FakeError::Network),
            (3, Duration::from_millis(4_000), FakeError::Network),
        ]
    );
}

#[tokio::test]
async fn recovers_once_upstream_comes_back() {
    let (governor, _clock) = governor();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = governor
        .execute_with_retry(
            "ndvi:health",
            scripted(&calls, vec![Err(FakeError::Status(429)), Ok(11)]),
            RetryOptions::new(),
        )
        .await;

    assert_eq!(result, Ok(11));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(governor.get_status("ndvi:health").remaining, 28);
}

#[tokio::test]
async fn zero_max_retries_still_makes_one_attempt() {
    let (governor, _clock) = governor();
    governor.set_config(
        "once",
        &ConfigPatch {
            max_retries: Some(0),
            ..Default::default()
        },
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let result = governor
        .execute_with_retry(
            "once:only",
            scripted(&calls, vec![Err(FakeError::Status(503))]),
            RetryOptions::new(),
        )
        .await;

    assert_eq!(result, Err(FakeError::Status(503)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn instances_do_not_share_state() {
    let (a, _) = governor();
    let (b, _) = governor();

    a.record_request("auth:login");
    a.set_config(
        "auth",
        &ConfigPatch {
            max_requests: Some(1),
            ..Default::default()
        },
    );

    assert_eq!(a.get_status("auth:login").remaining, 0);
    assert_eq!(b.get_status("auth:login").remaining, 10);
}

#[tokio::test]
async fn reset_clears_quota() {
    let (governor, _clock) = governor();
    for _ in 0..10 {
        governor.record_request("auth:login");
    }
    governor.record_request("upload:photo");

    governor.reset("auth:login");
    assert_eq!(governor.get_status("auth:login").remaining, 10);
    assert!(governor.limiter().peek("upload:photo").is_some());

    governor.reset_all();
    assert!(governor.limiter().is_empty());
}
