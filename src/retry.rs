//! Bounded Exponential-Backoff Retry
//!
//! All remote-storage operations go through [`retry`]: a fixed attempt
//! count, doubling delay with a cap, and a caller-supplied predicate that
//! whitelists transient error kinds. Non-whitelisted errors and attempt
//! exhaustion propagate immediately.
//!
//! Retry state (attempt number, next delay) is explicit and handed to the
//! between-attempts callback as a value, not mutated through closures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: attempt cap and delay schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (must be >= 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for tests (tiny delays, no jitter)
    pub fn test() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: false,
        }
    }

    /// Delay before the attempt after `attempt` (1-based): doubling from
    /// `initial_delay`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        base.min(self.max_delay)
    }
}

/// State handed to the between-attempts callback.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// The error that failed this attempt
    pub error: &'a E,
    /// 1-based attempt number that just failed
    pub attempt: u32,
    /// Delay before the next attempt
    pub next_delay: Duration,
}

/// Run `op` with bounded exponential backoff.
///
/// `op` receives the 1-based attempt number. `is_transient` whitelists
/// retryable error kinds; anything else propagates immediately, as does the
/// final attempt's error.
pub async fn retry<T, E, F, Fut, P, C>(
    policy: &RetryPolicy,
    mut is_transient: P,
    mut on_retry: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    C: FnMut(&RetryAttempt<'_, E>),
{
    debug_assert!(
        policy.max_attempts >= 1,
        "Precondition: retry policy must allow at least one attempt"
    );

    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_attempts || !is_transient(&error) {
                    return Err(error);
                }
                let mut next_delay = policy.delay_after(attempt);
                if policy.jitter {
                    let jitter_cap = (next_delay.as_millis() as u64 / 4).max(1);
                    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
                    next_delay += Duration::from_millis(jitter);
                }
                on_retry(&RetryAttempt {
                    error: &error,
                    attempt,
                    next_delay,
                });
                tokio::time::sleep(next_delay).await;
                attempt += 1;
            }
        }
    }
}

/// Convenience wrapper: log retries via `tracing` and use no other callback.
pub async fn retry_logged<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_transient: P,
    op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    retry(
        policy,
        is_transient,
        |state| {
            warn!(
                operation,
                attempt = state.attempt,
                delay_ms = state.next_delay.as_millis() as u64,
                error = %state.error,
                "transient failure, retrying"
            );
        },
        op,
    )
    .await
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
