use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Longest delay the controller will schedule: `i32::MAX` milliseconds
/// (about 24.8 days). Delays are stored in a signed 32-bit millisecond field
/// on some runtimes and wrap past this point; the watchdog covers anything
/// longer.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

pub fn clamp_delay(delay: Duration) -> Duration {
    delay.min(MAX_TIMER_DELAY)
}

/// Time left until `deadline_ms`, zero when it has already passed.
pub fn delay_until(deadline_ms: i64, now_ms: i64) -> Duration {
    let remaining = deadline_ms.saturating_sub(now_ms);
    if remaining <= 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(remaining as u64)
    }
}

struct Armed {
    handle: JoinHandle<()>,
    delay: Duration,
    fires_at: Instant,
}

/// Owns at most one pending one-shot task.
#[derive(Default)]
pub struct TimerController {
    slot: Mutex<Option<Armed>>,
}

impl TimerController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pending timer with one that runs `task` after `delay`
    /// (clamped to [`MAX_TIMER_DELAY`]). Returns the delay actually used.
    ///
    /// Only the wait is cancellable: once the delay elapses the task is
    /// spawned on its own, so it may re-arm this controller without aborting
    /// itself.
    pub fn arm<F>(&self, delay: Duration, task: F) -> Duration
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let clamped = clamp_delay(delay);
        if clamped < delay {
            tracing::debug!(
                target: "beach::session::timer",
                requested_ms = delay.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "clamping renewal timer delay"
            );
        }

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(clamped).await;
            tokio::spawn(task);
        });
        *slot = Some(Armed {
            handle,
            delay: clamped,
            fires_at: Instant::now() + clamped,
        });
        clamped
    }

    /// Cancels the pending timer, if any. Returns whether one was pending.
    pub fn disarm(&self) -> bool {
        match self.slot.lock().take() {
            Some(armed) => {
                let pending = !armed.handle.is_finished();
                armed.handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map(|armed| !armed.handle.is_finished())
            .unwrap_or(false)
    }

    /// Delay the pending timer was armed with.
    pub fn armed_for(&self) -> Option<Duration> {
        self.slot
            .lock()
            .as_ref()
            .filter(|armed| !armed.handle.is_finished())
            .map(|armed| armed.delay)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.slot
            .lock()
            .as_ref()
            .filter(|armed| !armed.handle.is_finished())
            .map(|armed| armed.fires_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TimerController {
    fn drop(&mut self) {
        if let Some(armed) = self.slot.get_mut().take() {
            armed.handle.abort();
        }
    }
}
