//! Exponential-backoff retry around remote calls.
//!
//! [`ResilientRemoteInvoker`] runs an async operation up to
//! [`RetryPolicy::max_attempts`] times. Failures are classified through
//! [`RetryClassify`]: transient failures are retried after a backoff of
//! `base_delay * 2^attempt`, fatal failures are returned immediately.
//!
//! Backoff uses `tokio::time::sleep`, so only the calling task is
//! suspended. The invoker keeps no state between calls; a fresh
//! [`RetryState`] is created for every invocation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use aggregator_types::ErrorKind;
use rand::Rng;
use tracing::{debug, info, warn};

/// Default number of attempts, including the first try.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for the exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Decides whether a failure is worth retrying.
pub trait RetryClassify {
    /// `true` if the failure may succeed on a later attempt.
    fn is_transient(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Attempt budget and backoff schedule for one invoker.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    /// Create a policy with no delay cap and no jitter.
    ///
    /// A `max_attempts` of zero is treated as one: the operation always
    /// runs at least once.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_ratio: 0.0,
        }
    }

    /// Cap every computed delay at `max_delay`.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Add up to `ratio * delay` of random extra wait to each backoff.
    ///
    /// The ratio is clamped to `0.0..=1.0`; non-finite values disable
    /// jitter.
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Total attempts allowed, including the first try.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay of the backoff schedule.
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound on a single delay, if any.
    pub const fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Jitter ratio in `0.0..=1.0`.
    pub const fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Deterministic backoff after `attempt` (1-based) has failed.
    ///
    /// Computes `base_delay * 2^attempt`, saturating at [`Duration::MAX`]
    /// and capped by the configured maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        self.cap(raw)
    }

    /// Backoff after `attempt` has failed, with jitter applied.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range(0.0..=self.jitter_ratio);
        let extra =
            Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::ZERO);
        self.cap(delay.saturating_add(extra))
    }

    fn cap(&self, delay: Duration) -> Duration {
        self.max_delay.map_or(delay, |max| delay.min(max))
    }
}

// ---------------------------------------------------------------------------
// Per-invocation state
// ---------------------------------------------------------------------------

/// Progress of a single invocation. Created per call, dropped when the
/// call succeeds or gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryState {
    /// Fresh state for a policy; no attempt made yet.
    pub const fn begin(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
        }
    }

    /// Number of attempts started so far.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempt budget.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay of the schedule this state follows.
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Start the next attempt and return its 1-based number.
    pub const fn start_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// `true` once every allowed attempt has been started.
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Failure of a retried invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError<E> {
    /// The operation failed with a non-retryable error.
    #[error("fatal failure on attempt {attempt}: {source}")]
    Fatal {
        /// Attempt on which the fatal error occurred.
        attempt: u32,
        /// The underlying error.
        source: E,
    },

    /// Every attempt failed transiently.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The error from the last attempt.
        source: E,
    },
}

impl<E> InvokeError<E> {
    /// Number of attempts made before giving up.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } => *attempt,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error.
    pub const fn last_error(&self) -> &E {
        match self {
            Self::Fatal { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    /// Consume the wrapper and return the last underlying error.
    pub fn into_last_error(self) -> E {
        match self {
            Self::Fatal { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }

    /// Machine-readable classification.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal { .. } => ErrorKind::FatalUpstreamError,
            Self::Exhausted { .. } => ErrorKind::TransientUpstreamError,
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation returned a value.
    Succeeded,
    /// The operation failed with a retryable error.
    TransientFailure,
    /// The operation failed with a non-retryable error.
    FatalFailure,
}

/// Report of one attempt, passed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Wait scheduled before the next attempt, if one follows.
    pub delay: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

/// Runs remote operations with exponential-backoff retry.
#[derive(Debug, Clone, Default)]
pub struct ResilientRemoteInvoker {
    policy: RetryPolicy,
}

impl ResilientRemoteInvoker {
    /// Create an invoker with the given policy.
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in effect.
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, or the attempt
    /// budget runs out.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::Fatal`] on the first non-retryable failure and
    /// [`InvokeError::Exhausted`] with the last error once every attempt
    /// has failed transiently.
    pub async fn invoke<T, E, F, Fut>(&self, operation: F) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + fmt::Display,
    {
        self.invoke_observed(operation, |_| {}).await
    }

    /// Same as [`invoke`](Self::invoke), reporting every attempt to
    /// `observer` as it completes.
    ///
    /// # Errors
    ///
    /// See [`invoke`](Self::invoke).
    pub async fn invoke_observed<T, E, F, Fut, O>(
        &self,
        mut operation: F,
        mut observer: O,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + fmt::Display,
        O: FnMut(&AttemptRecord),
    {
        let mut state = RetryState::begin(&self.policy);

        loop {
            let attempt = state.start_attempt();

            match operation().await {
                Ok(value) => {
                    debug!(attempt, "remote call succeeded");
                    observer(&AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::Succeeded,
                        delay: None,
                    });
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    warn!(attempt, error = %error, "remote call failed fatally, not retrying");
                    observer(&AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::FatalFailure,
                        delay: None,
                    });
                    return Err(InvokeError::Fatal {
                        attempt,
                        source: error,
                    });
                }
                Err(error) if state.is_exhausted() => {
                    warn!(
                        attempt,
                        max_attempts = state.max_attempts(),
                        error = %error,
                        "remote call failed, retry budget exhausted"
                    );
                    observer(&AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::TransientFailure,
                        delay: None,
                    });
                    return Err(InvokeError::Exhausted {
                        attempts: attempt,
                        source: error,
                    });
                }
                Err(error) => {
                    let delay = self.policy.backoff(attempt);
                    info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "remote call failed transiently, backing off"
                    );
                    observer(&AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::TransientFailure,
                        delay: Some(delay),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Failure {
        Transient(u32),
        Fatal,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Transient(n) => write!(f, "transient #{n}"),
                Self::Fatal => write!(f, "fatal"),
            }
        }
    }

    impl RetryClassify for Failure {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Transient(_))
        }
    }

    /// Operation that fails transiently `failures` times, then returns 42.
    fn flaky(
        calls: &AtomicU32,
        failures: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, Failure>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(Failure::Transient(n))
            } else {
                Ok(42)
            })
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn delay_saturates_and_respects_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(200), Duration::MAX);

        let capped = RetryPolicy::default().with_max_delay(Duration::from_secs(5));
        assert_eq!(capped.delay_for(1), Duration::from_secs(2));
        assert_eq!(capped.delay_for(3), Duration::from_secs(5));
        assert_eq!(capped.delay_for(200), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn jitter_ratio_is_sanitised() {
        assert_eq!(RetryPolicy::default().with_jitter(7.0).jitter_ratio(), 1.0);
        assert_eq!(RetryPolicy::default().with_jitter(-1.0).jitter_ratio(), 0.0);
        assert_eq!(RetryPolicy::default().with_jitter(f64::NAN).jitter_ratio(), 0.0);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, DEFAULT_BASE_DELAY).max_attempts(), 1);
    }

    #[test]
    fn retry_state_counts_attempts() {
        let mut state = RetryState::begin(&RetryPolicy::new(2, DEFAULT_BASE_DELAY));
        assert_eq!(state.attempt(), 0);
        assert!(!state.is_exhausted());
        assert_eq!(state.start_attempt(), 1);
        assert!(!state.is_exhausted());
        assert_eq!(state.start_attempt(), 2);
        assert!(state.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_four_transient_failures() {
        let invoker = ResilientRemoteInvoker::default();
        let calls = AtomicU32::new(0);
        let mut records = Vec::new();
        let started = tokio::time::Instant::now();

        let result = invoker
            .invoke_observed(flaky(&calls, 4), |record| records.push(*record))
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let delays: Vec<Duration> = records.iter().filter_map(|r| r.delay).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(started.elapsed() >= Duration::from_secs(2 + 4 + 8 + 16));

        let last = records.last().unwrap();
        assert_eq!(last.attempt, 5);
        assert_eq!(last.outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_five_transient_failures() {
        let invoker = ResilientRemoteInvoker::default();
        let calls = AtomicU32::new(0);

        let result = invoker.invoke(flaky(&calls, 10)).await;

        let Err(InvokeError::Exhausted { attempts, source }) = result else {
            panic!("expected exhaustion, got {result:?}");
        };
        assert_eq!(attempts, 5);
        assert_eq!(source, Failure::Transient(5));
        assert_eq!(calls.load(Ordering::SeqCst), 5, "no sixth attempt");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_does_not_hold_up_other_calls() {
        let started = tokio::time::Instant::now();
        let backing_off = tokio::spawn(async move {
            let calls = AtomicU32::new(0);
            ResilientRemoteInvoker::default()
                .invoke(flaky(&calls, 1))
                .await
        });
        tokio::task::yield_now().await;

        let invoker = ResilientRemoteInvoker::default();
        let quick = invoker
            .invoke(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Failure>(7)
            })
            .await;

        assert_eq!(quick.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!backing_off.is_finished(), "first call is still waiting out its delay");

        assert_eq!(backing_off.await.unwrap().unwrap(), 42);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_returns_immediately() {
        let invoker = ResilientRemoteInvoker::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, _> = invoker
            .invoke(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err(Failure::Fatal))
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, InvokeError::Fatal { attempt: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::FatalUpstreamError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_after_transient_stops_retrying() {
        let invoker = ResilientRemoteInvoker::default();
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = invoker
            .invoke(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                std::future::ready(if n == 1 {
                    Err(Failure::Transient(n))
                } else {
                    Err(Failure::Fatal)
                })
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert_eq!(err.into_last_error(), Failure::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
