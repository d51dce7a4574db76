use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Fixed-period safety net. Unlike the renewal timer it does not depend on a
/// particular deadline, so a timer lost to system sleep or a suspended process
/// is caught on the next tick.
pub struct Watchdog {
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            handle: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts ticking unless already running. `tick` returns `false` to end
    /// the loop.
    pub fn start<F, Fut>(&self, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return false;
        }

        let period = self.period;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tick().await {
                    break;
                }
            }
        }));
        tracing::debug!(
            target: "beach::session",
            period_ms = period.as_millis() as u64,
            "watchdog started"
        );
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            tracing::debug!(target: "beach::session", "watchdog stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
