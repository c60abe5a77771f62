//! Retry policy with exponential backoff, jitter and an overall deadline.
//!
//! The policy is a plain value; callers choose one and hand it to
//! [`with_retry`] together with a classifier that decides which errors are
//! worth another attempt.

use crate::cancellation::CancellationToken;
use crate::errors::{NodeStateError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Give up once this much time has elapsed since the first attempt.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied per retry.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Maximum delay cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> usize {
    15
}

fn default_deadline_ms() -> u64 {
    15 * 60 * 1000
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            deadline_ms: default_deadline_ms(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff factor.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the deadline as a Duration.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn base_delay(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = (self.base_delay_ms as f64) * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry` with jitter applied.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay(&self, retry: usize) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = (base.as_millis() as f64 * self.jitter) as u64;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// State tracking for a single retried operation.
#[derive(Debug)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: usize,
    started: Instant,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Time since the first attempt.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Makes a retry decision after a failed attempt.
#[must_use]
pub fn should_retry(state: &mut RetryState, policy: &RetryPolicy, retryable: bool) -> RetryDecision {
    state.attempt += 1;
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if state.attempt >= policy.max_attempts {
        return RetryDecision::GiveUp;
    }
    let delay = policy.delay(state.attempt - 1);
    if state.elapsed() + delay > policy.deadline() {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(delay)
}

/// Executes an operation, retrying errors the classifier accepts.
///
/// Returns the last error once the policy gives up.
pub async fn with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: C,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&NodeStateError) -> bool,
{
    with_retry_cancellable(policy, operation_name, None, is_retryable, operation).await
}

/// Like [`with_retry`], but stops waiting between attempts once `token` is
/// cancelled.
pub async fn with_retry_cancellable<T, F, Fut, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    token: Option<&CancellationToken>,
    is_retryable: C,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&NodeStateError) -> bool,
{
    let mut state = RetryState::new();

    loop {
        if let Some(token) = token {
            if token.is_cancelled() {
                return Err(NodeStateError::cancelled(
                    token.reason().unwrap_or_else(|| operation_name.to_string()),
                ));
            }
        }

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        match should_retry(&mut state, policy, is_retryable(&err)) {
            RetryDecision::Retry(delay) => {
                debug!(
                    operation = %operation_name,
                    attempt = state.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after error"
                );
                match token {
                    Some(token) => {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = token.cancelled() => {
                                return Err(NodeStateError::cancelled(
                                    token.reason().unwrap_or_else(|| operation_name.to_string()),
                                ));
                            }
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
            RetryDecision::GiveUp => {
                warn!(
                    operation = %operation_name,
                    attempts = state.attempt,
                    error = %err,
                    "Retry attempts exhausted"
                );
                return Err(err);
            }
            RetryDecision::NotRetryable => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_base_delay_ms(1)
            .with_max_delay_ms(2)
            .with_jitter(0.0)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 15);
        assert_eq!(policy.deadline(), Duration::from_secs(15 * 60));
        assert_eq!(policy.base_delay_ms, 1000);
        assert!((policy.factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.max_delay_ms, 60_000);
        assert!((policy.jitter - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(32));
        assert_eq!(policy.base_delay(6), Duration::from_secs(60));
        assert_eq!(policy.base_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(2);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_millis(4400));
        }
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = fast_policy().with_max_attempts(3);
        let mut state = RetryState::new();
        assert!(matches!(should_retry(&mut state, &policy, true), RetryDecision::Retry(_)));
        assert!(matches!(should_retry(&mut state, &policy, true), RetryDecision::Retry(_)));
        assert_eq!(should_retry(&mut state, &policy, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_should_retry_respects_deadline() {
        let policy = RetryPolicy::default().with_deadline(Duration::from_millis(500));
        let mut state = RetryState::new();
        assert_eq!(should_retry(&mut state, &policy, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_not_retryable() {
        let mut state = RetryState::new();
        assert_eq!(
            should_retry(&mut state, &RetryPolicy::default(), false),
            RetryDecision::NotRetryable
        );
    }

    #[tokio::test]
    async fn test_with_retry_eventually_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = with_retry(&fast_policy(), "flaky", |_| true, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(NodeStateError::transient("reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_permanent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = with_retry(
            &fast_policy(),
            "permanent",
            |e| e.kind() == crate::errors::ErrorKind::Transient,
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(NodeStateError::permanent("nope")) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<()> = with_retry(&fast_policy().with_max_attempts(4), "always", |_| true, || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Err(NodeStateError::transient(format!("attempt {n}"))) }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "transient error: attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::default().with_base_delay_ms(10_000).with_jitter(0.0);
        let fut = with_retry_cancellable(&policy, "slow", Some(&token), |_| true, || async {
            Err::<(), _>(NodeStateError::transient("down"))
        });
        tokio::pin!(fut);

        tokio::select! {
            _ = &mut fut => panic!("should still be backing off"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        token.cancel("shutdown");
        let result = tokio::time::timeout(Duration::from_secs(1), fut).await.unwrap();
        assert_eq!(result.unwrap_err().kind(), crate::errors::ErrorKind::Cancelled);
    }
}
