//! Bounded waits. Every wait in the crate (readiness polling, sub-fetch
//! deadlines, restore waits, the send settle delay) goes through here so an
//! abandoned operation always turns into a value instead of a hang.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} timed out after {}ms", .after.as_millis())]
pub struct Elapsed {
    pub operation: &'static str,
    pub after: Duration,
}

impl From<Elapsed> for SessionError {
    fn from(value: Elapsed) -> Self {
        SessionError::Timeout {
            operation: value.operation,
            after: value.after,
        }
    }
}

/// Races `future` against a timer. On expiry the future is dropped and its
/// eventual result discarded.
pub async fn with_timeout<F>(
    operation: &'static str,
    after: Duration,
    future: F,
) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| Elapsed { operation, after })
}

/// Like [`with_timeout`] but substitutes `fallback` on expiry.
pub async fn with_fallback<F>(after: Duration, future: F, fallback: F::Output) -> F::Output
where
    F: Future,
{
    tokio::time::timeout(after, future)
        .await
        .unwrap_or(fallback)
}

/// Applies a deadline only when one is configured.
pub async fn with_optional_timeout<F>(
    operation: &'static str,
    after: Option<Duration>,
    future: F,
) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    match after {
        Some(after) => with_timeout(operation, after, future).await,
        None => Ok(future.await),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    /// Upper bound on time spent sleeping between attempts.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError<E> {
    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("polling aborted: {0}")]
    Aborted(E),
}

/// Runs `probe` up to `policy.attempts` times, sleeping `policy.interval`
/// between attempts. `Ok(Some(_))` finishes, `Ok(None)` retries and `Err`
/// aborts immediately.
pub async fn poll<T, E, F, Fut>(policy: PollPolicy, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 0..policy.attempts {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => return Err(PollError::Aborted(err)),
        }
        if attempt + 1 < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(PollError::Exhausted {
        attempts: policy.attempts,
    })
}

/// Fixed pause before re-reading state that a flaky transport may not have
/// settled yet.
pub async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "tests/timeouts_tests.rs"]
mod tests;
