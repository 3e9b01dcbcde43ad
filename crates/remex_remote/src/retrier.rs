//! Bounded retry with exponential backoff.

use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (0 behaves like 1)
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Relative random spread applied to each delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial backoff
    #[must_use]
    pub fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-based), without jitter
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.saturating_sub(1).min(63) as i32);
        let ms = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay before retry number `retry` (1-based), jittered and capped
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let ms = (base * factor).clamp(0.0, self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// A unit of work the retrier can re-run
///
/// An attempt must be safe to repeat after a partial failure.
#[async_trait]
pub trait RetryableOperation: Send {
    /// Value produced by a successful attempt
    type Output: Send;

    /// Run one attempt
    ///
    /// # Errors
    ///
    /// Returns the classified failure of this attempt
    async fn attempt(&mut self) -> RemoteResult<Self::Output>;
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
    cancellation: CancellationToken,
}

impl Retrier {
    /// Create a retrier
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancellation: CancellationToken::new(),
        }
    }

    /// Abort attempts and backoff when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The policy in use
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// attempts are used up
    ///
    /// # Errors
    ///
    /// Returns the first non-retriable error, the last error once attempts
    /// are exhausted, or an `Interrupted` error on cancellation
    pub async fn execute<O: RetryableOperation>(&self, op: &mut O) -> RemoteResult<O::Output> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if self.cancellation.is_cancelled() {
                return Err(RemoteError::interrupted());
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = self.cancellation.cancelled() => Err(RemoteError::interrupted()),
                outcome = op.attempt() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            if !err.is_retriable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = self.policy.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => return Err(RemoteError::interrupted()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RemoteErrorKind;
    use std::collections::VecDeque;

    struct Scripted {
        outcomes: VecDeque<RemoteResult<u32>>,
        calls: u32,
    }

    impl Scripted {
        fn new(outcomes: Vec<RemoteResult<u32>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl RetryableOperation for Scripted {
        type Output = u32;

        async fn attempt(&mut self) -> RemoteResult<u32> {
            self.calls += 1;
            self.outcomes
                .pop_front()
                .unwrap_or_else(|| Err(RemoteError::fatal("script exhausted")))
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::default().with_initial_backoff_ms(1).with_jitter(0.0)
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let mut op = Scripted::new(vec![
            Err(RemoteError::transient("blip")),
            Err(RemoteError::unavailable("down")),
            Ok(7),
        ]);
        let value = Retrier::new(fast()).execute(&mut op).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(op.calls, 3);
    }

    #[tokio::test]
    async fn test_non_retriable_fails_first_attempt() {
        let mut op = Scripted::new(vec![Err(RemoteError::new(RemoteErrorKind::ExecutionTimeout, "slow")), Ok(1)]);
        let err = Retrier::new(fast()).execute(&mut op).await.unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::ExecutionTimeout);
        assert_eq!(op.calls, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let mut op = Scripted::new(vec![
            Err(RemoteError::transient("one")),
            Err(RemoteError::transient("two")),
            Err(RemoteError::unavailable("three")),
        ]);
        let err = Retrier::new(fast().with_max_attempts(3))
            .execute(&mut op)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Unavailable);
        assert_eq!(err.message(), "three");
        assert_eq!(op.calls, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let mut op = Scripted::new(vec![Ok(1)]);
        let err = Retrier::new(fast())
            .with_cancellation(token)
            .execute(&mut op)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Interrupted);
        assert_eq!(op.calls, 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::default()
            .with_initial_backoff_ms(60_000)
            .with_jitter(0.0);
        let retrier = Retrier::new(RetryPolicy {
            max_backoff_ms: 60_000,
            ..policy
        })
        .with_cancellation(token.clone());
        let mut op = Scripted::new(vec![Err(RemoteError::transient("blip")), Ok(1)]);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = retrier.execute(&mut op).await.unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.kind(), RemoteErrorKind::Interrupted);
        assert_eq!(op.calls, 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(30), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.delay(2).as_millis();
            assert!((100..=300).contains(&d), "{d}");
        }
    }

    #[test]
    fn test_policy_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_backoff_ms, 100);
    }
}
