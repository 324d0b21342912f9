//! Local rate-limit governor.
//!
//! Once the remote reports quota exhaustion the governor is *saturated*: every
//! call is refused locally until the cooldown elapses. The cooldown is the
//! retry mechanism for rate limits; nothing retries a 429 directly.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use marketgrid_core::{GridError, GridResult};
use marketgrid_events::{Notice, Notifier};

/// Cooldown armed after a quota failure unless configured otherwise.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Longest cooldown the governor arms; longer requests are clamped.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Saturation flag plus the instant it lifts.
///
/// `saturated` implies `reset_at` is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RateLimitState {
    pub saturated: bool,
    pub reset_at: Option<Instant>,
}

impl RateLimitState {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        match (self.saturated, self.reset_at) {
            (true, Some(at)) if now < at => Some(at - now),
            _ => None,
        }
    }
}

/// Short-circuits inference calls while a quota cooldown is running.
pub struct RateLimitGovernor {
    // `None` until the first quota signal.
    state: Arc<Mutex<Option<RateLimitState>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    notifier: Arc<dyn Notifier>,
}

impl RateLimitGovernor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            timer: Mutex::new(None),
            notifier,
        }
    }

    /// Current state; `None` if saturation was never signalled.
    pub fn state(&self) -> Option<RateLimitState> {
        *lock(&self.state)
    }

    pub fn is_saturated(&self) -> bool {
        self.retry_in().is_some()
    }

    /// Time left in the current cooldown.
    ///
    /// Checked against the clock as well as the reset timer, so an elapsed
    /// cooldown reads as clear even before the timer task has run.
    pub fn retry_in(&self) -> Option<Duration> {
        lock(&self.state).and_then(|s| s.remaining(Instant::now()))
    }

    /// Enter saturation for `cooldown` and schedule the automatic clear.
    ///
    /// Re-arming while saturated cancels the pending clear and replaces it, so
    /// there is never more than one timer. `cooldown` is clamped to
    /// [`MAX_COOLDOWN`].
    pub fn mark_saturated(&self, cooldown: Duration) {
        if cooldown > MAX_COOLDOWN {
            warn!(requested_secs = cooldown.as_secs(), "cooldown clamped");
        }
        let cooldown = cooldown.min(MAX_COOLDOWN);
        let reset_at = Instant::now() + cooldown;
        *lock(&self.state) = Some(RateLimitState {
            saturated: true,
            reset_at: Some(reset_at),
        });

        let mut timer = lock(&self.timer);
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let state = Arc::clone(&self.state);
                *timer = Some(runtime.spawn(async move {
                    tokio::time::sleep_until(reset_at).await;
                    let mut state = lock(&state);
                    // A later re-arm owns the state now.
                    if state.is_some_and(|s| s.reset_at == Some(reset_at)) {
                        *state = Some(RateLimitState::default());
                        debug!("inference cooldown elapsed");
                    }
                }));
            }
            Err(_) => debug!("no async runtime; saturation will clear on next check"),
        }
        drop(timer);

        warn!(cooldown_secs = cooldown.as_secs(), "inference grid saturated");
        self.notifier.notify(Notice::saturation_armed(cooldown));
    }

    /// Run `op` unless saturated; otherwise fail fast with
    /// [`GridError::GridSaturated`] without touching `op`.
    pub async fn guard<T, F, Fut>(&self, op: F) -> GridResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GridResult<T>>,
    {
        if let Some(retry_in) = self.retry_in() {
            debug!(retry_in_ms = retry_in.as_millis() as u64, "refusing inference call");
            self.notifier.notify(Notice::inference_refused(retry_in));
            return Err(GridError::GridSaturated { retry_in });
        }
        op().await
    }
}

impl Drop for RateLimitGovernor {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

impl core::fmt::Debug for RateLimitGovernor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimitGovernor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
