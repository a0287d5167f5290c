//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry policy for transient setup failures (network fetches).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Wall-clock limit for a single attempt (seconds).
    pub attempt_timeout_secs: u64,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on the delay between attempts (milliseconds).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout_secs: 120,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Timeout applied to each attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// A value produced by a retried operation, with the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    /// Number of attempts made (1 = no retries used).
    pub attempts: u32,
}

/// The error that ended a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// `true` when the attempt budget ran out on a transient error,
    /// `false` when a non-transient error stopped the loop early.
    pub exhausted: bool,
}

/// Run `op` until it succeeds, fails non-transiently, or the attempt budget
/// is spent.
///
/// `op` receives the 1-based attempt number. `is_transient` decides whether an
/// error is worth another attempt.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    is_transient: P,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) if !is_transient(&error) => {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: false,
                })
            }
            Err(error) if attempt >= max_attempts => {
                warn!(step = label, attempt, error = %error, "giving up after final attempt");
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }
            Err(error) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    step = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
