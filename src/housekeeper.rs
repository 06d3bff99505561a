use std::sync::Weak;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::info;

use crate::rate_limit::RateLimiter;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_IDLE_AGE: Duration = Duration::from_secs(5 * 60);

/// Background sweep evicting idle rate limit entries.
///
/// Stops on `stop()`, on drop, or once the limiter it watches is gone.
pub struct Housekeeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn spawn(limiter: Weak<RateLimiter>, period: Duration, max_age: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(?period, ?max_age, "housekeeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(limiter) = limiter.upgrade() else {
                            break;
                        };
                        limiter.evict_idle(max_age);
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            info!("housekeeper stopped");
        });

        Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the sweep loop and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
