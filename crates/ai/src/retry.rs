//! Retry with exponential backoff for inference calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use marketgrid_core::{GridError, GridResult, InferenceFailure};
use marketgrid_events::{Notice, Notifier};

use crate::backend::CredentialRecalibrator;
use crate::governor::{DEFAULT_COOLDOWN, RateLimitGovernor};

/// How many times to retry a transient failure, and how long to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    /// Wait before the first retry; doubles for each retry after it.
    pub base_delay: Duration,
    /// Ceiling for any single wait; `None` leaves the growth unbounded.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Remove the delay ceiling.
    pub fn uncapped(mut self) -> Self {
        self.max_delay = None;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before attempt `attempt` (1-indexed): zero for the first,
    /// `base_delay * 2^(attempt - 2)` afterwards, capped at `max_delay`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let delay = 2u32
            .checked_pow(attempt - 2)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Every wait an always-failing operation goes through.
    pub fn schedule(&self) -> Vec<Duration> {
        (2..=self.max_attempts())
            .map(|attempt| self.delay_before_attempt(attempt))
            .collect()
    }
}

/// One execution inside a [`BackoffRetrier`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-indexed.
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// The policy's base delay.
    pub base_delay: Duration,
    /// Wait applied if this attempt fails transiently.
    pub next_delay: Duration,
    pub last_error: Option<InferenceFailure>,
}

impl RetryAttempt {
    fn first(policy: &RetryPolicy) -> Self {
        Self {
            attempt_number: 1,
            max_attempts: policy.max_attempts(),
            base_delay: policy.base_delay,
            next_delay: policy.delay_before_attempt(2),
            last_error: None,
        }
    }

    fn next(self, failure: InferenceFailure, policy: &RetryPolicy) -> Self {
        let attempt_number = self.attempt_number + 1;
        Self {
            attempt_number,
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            next_delay: policy.delay_before_attempt(attempt_number + 1),
            last_error: Some(failure),
        }
    }

    pub fn is_last(&self) -> bool {
        self.attempt_number >= self.max_attempts
    }
}

/// Runs a fallible inference operation, classifying each failure:
///
/// - rate limited: arm the governor cooldown, fail with `QuotaExhausted`;
/// - invalid credential: trigger recalibration, fail with `CredentialInvalid`;
/// - anything else: back off and retry until the policy runs out, then fail
///   with `TransientFailure` carrying the last error.
///
/// Total attempts never exceed `policy.max_retries + 1`.
pub struct BackoffRetrier {
    governor: Arc<RateLimitGovernor>,
    recalibrator: Arc<dyn CredentialRecalibrator>,
    notifier: Arc<dyn Notifier>,
    quota_cooldown: Duration,
}

impl BackoffRetrier {
    pub fn new(
        governor: Arc<RateLimitGovernor>,
        recalibrator: Arc<dyn CredentialRecalibrator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            governor,
            recalibrator,
            notifier,
            quota_cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Cooldown armed on the governor when a call is rate limited.
    pub fn with_quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.quota_cooldown = cooldown;
        self
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    pub async fn execute<T, F, Fut>(&self, op: F, policy: &RetryPolicy) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceFailure>>,
    {
        self.execute_with_cancel(op, policy, &CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`GridError::Cancelled`] as soon as `cancel` fires, including in the
    /// middle of a backoff wait.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        mut op: F,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> GridResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InferenceFailure>>,
    {
        let mut attempt = RetryAttempt::first(policy);

        loop {
            if cancel.is_cancelled() {
                return Err(GridError::Cancelled);
            }

            let failure = match op().await {
                Ok(value) => {
                    if attempt.attempt_number > 1 {
                        debug!(attempt = attempt.attempt_number, "inference succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            match failure {
                InferenceFailure::RateLimited(message) => {
                    self.governor.mark_saturated(self.quota_cooldown);
                    return Err(GridError::QuotaExhausted {
                        message,
                        cooldown: self.quota_cooldown,
                    });
                }
                InferenceFailure::InvalidCredential(message) => {
                    warn!(error = %message, "inference credential rejected; recalibrating");
                    self.notifier
                        .notify(Notice::credential_recalibrating(message.clone()));
                    self.recalibrator.recalibrate().await;
                    return Err(GridError::CredentialInvalid(message));
                }
                failure @ InferenceFailure::Other(_) => {
                    if attempt.is_last() {
                        warn!(
                            attempts = attempt.attempt_number,
                            error = %failure,
                            "inference failed; retries exhausted"
                        );
                        return Err(GridError::TransientFailure {
                            attempts: attempt.attempt_number,
                            last: failure,
                        });
                    }

                    let delay = attempt.next_delay;
                    warn!(
                        attempt = attempt.attempt_number,
                        max_attempts = attempt.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "inference attempt failed; backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GridError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt = attempt.next(failure, policy);
                }
            }
        }
    }
}

impl core::fmt::Debug for BackoffRetrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackoffRetrier")
            .field("quota_cooldown", &self.quota_cooldown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketgrid_events::{EventBus, NoticeBus};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct CountingRecalibrator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialRecalibrator for CountingRecalibrator {
        async fn recalibrate(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        retrier: BackoffRetrier,
        governor: Arc<RateLimitGovernor>,
        recalibrator: Arc<CountingRecalibrator>,
        bus: Arc<NoticeBus>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(NoticeBus::new());
        let governor = Arc::new(RateLimitGovernor::new(bus.clone()));
        let recalibrator = Arc::new(CountingRecalibrator::default());
        let retrier = BackoffRetrier::new(governor.clone(), recalibrator.clone(), bus.clone());
        Harness {
            retrier,
            governor,
            recalibrator,
            bus,
        }
    }

    #[test]
    fn default_schedule_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
            ]
        );
    }

    #[test]
    fn delays_respect_the_cap() {
        let policy = RetryPolicy::new(4, Duration::from_secs(20));
        assert_eq!(
            policy.schedule(),
            vec![
                Duration::from_secs(20),
                Duration::from_secs(30),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn attempts_carry_the_base_and_the_upcoming_wait() {
        let policy = RetryPolicy::default();
        let first = RetryAttempt::first(&policy);
        assert_eq!((first.attempt_number, first.max_attempts), (1, 4));
        assert_eq!(first.base_delay, Duration::from_millis(2000));
        assert_eq!(first.next_delay, Duration::from_millis(2000));

        let second = first.next(InferenceFailure::other("flaky"), &policy);
        assert_eq!(second.base_delay, Duration::from_millis(2000));
        assert_eq!(second.next_delay, Duration::from_millis(4000));
        assert_eq!(second.last_error, Some(InferenceFailure::other("flaky")));
        assert!(!second.is_last());
    }

    #[test]
    fn uncapped_delays_keep_doubling() {
        let policy = RetryPolicy::new(5, Duration::from_secs(20)).uncapped();
        assert_eq!(policy.delay_before_attempt(6), Duration::from_secs(320));
        assert_eq!(policy.delay_before_attempt(40), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_follows_backoff_schedule() {
        let h = harness();
        let calls: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let result: GridResult<()> = h
            .retrier
            .execute(
                || {
                    calls.lock().unwrap().push(Instant::now());
                    async { Err(InferenceFailure::other("upstream reset")) }
                },
                &RetryPolicy::default(),
            )
            .await;

        assert_eq!(
            result,
            Err(GridError::TransientFailure {
                attempts: 4,
                last: InferenceFailure::other("upstream reset"),
            })
        );

        let calls = calls.into_inner().unwrap();
        let waits: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let h = harness();
        let calls = AtomicUsize::new(0);

        let result = h
            .retrier
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(InferenceFailure::other("flaky"))
                        } else {
                            Ok("briefing")
                        }
                    }
                },
                &RetryPolicy::default(),
            )
            .await;

        assert_eq!(result, Ok("briefing"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_propagates_first_error() {
        let h = harness();
        let calls = AtomicUsize::new(0);

        let result: GridResult<()> = h
            .retrier
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(InferenceFailure::other("nope")) }
                },
                &RetryPolicy::no_retry(),
            )
            .await;

        assert_eq!(result.unwrap_err().last_failure(), Some(&InferenceFailure::other("nope")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_arms_cooldown_without_retrying() {
        let h = harness();
        let notices = h.bus.subscribe();
        let calls = AtomicUsize::new(0);

        let result: GridResult<()> = h
            .retrier
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(InferenceFailure::from_message("Error: 429 quota exceeded")) }
                },
                &RetryPolicy::default(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_saturation());
        assert!(matches!(err, GridError::QuotaExhausted { cooldown, .. } if cooldown == DEFAULT_COOLDOWN));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.governor.retry_in(), Some(DEFAULT_COOLDOWN));
        assert_eq!(notices.drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_credential_triggers_recalibration_once() {
        let h = harness();
        let calls = AtomicUsize::new(0);

        let result: GridResult<()> = h
            .retrier
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(InferenceFailure::from_message("Requested entity was not found.")) }
                },
                &RetryPolicy::default(),
            )
            .await;

        assert!(matches!(result, Err(GridError::CredentialInvalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.recalibrator.calls.load(Ordering::SeqCst), 1);
        assert!(!h.governor.is_saturated());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_quota_cooldown_is_used() {
        let h = harness();
        let retrier = h.retrier.with_quota_cooldown(Duration::from_secs(5));

        let result: GridResult<()> = retrier
            .execute(
                || async { Err(InferenceFailure::rate_limited("429")) },
                &RetryPolicy::default(),
            )
            .await;

        assert!(matches!(result, Err(GridError::QuotaExhausted { cooldown, .. }) if cooldown == Duration::from_secs(5)));
        assert_eq!(h.governor.retry_in(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_wait() {
        let h = harness();
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: GridResult<()> = h
            .retrier
            .execute_with_cancel(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(InferenceFailure::other("slow")) }
                },
                &RetryPolicy::default(),
                &cancel,
            )
            .await;

        assert_eq!(result, Err(GridError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_skips_the_call() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);

        let result: GridResult<()> = h
            .retrier
            .execute_with_cancel(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &RetryPolicy::default(),
                &cancel,
            )
            .await;

        assert_eq!(result, Err(GridError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        /// Property: waits never shrink, never exceed the cap, and follow
        /// `base * 2^(n-2)` while under it.
        #[test]
        fn schedule_is_monotonic_and_capped(
            retries in 0u32..12,
            base_ms in 1u64..5_000,
            cap_ms in 1u64..60_000,
        ) {
            let policy = RetryPolicy::new(retries, Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(cap_ms));
            let schedule = policy.schedule();

            prop_assert_eq!(schedule.len() as u32, retries);
            for pair in schedule.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            for (i, wait) in schedule.iter().enumerate() {
                let uncapped = Duration::from_millis(base_ms * (1u64 << i));
                prop_assert_eq!(*wait, uncapped.min(Duration::from_millis(cap_ms)));
            }
        }
    }
}
