//! Fixed-interval polling with a deadline.
//!
//! Every bounded loop of the controller (creation, update, external
//! connection, deletion drain, finalizer removal) is one [`RetryPolicy`]
//! handed to [`poll`]. The operation classifies its own failures: a
//! `backoff::Error::Permanent` ends the poll at once, a transient one is
//! retried after the policy interval until the deadline or attempt budget
//! runs out.

use crate::error::Error;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Interval and bounds of one polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts
    pub interval: Duration,
    /// Give up once this much time has passed; `None` polls forever
    pub timeout: Option<Duration>,
    /// Give up after this many attempts
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
            max_attempts: None,
        }
    }

    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            max_attempts: None,
        }
    }

    pub fn attempts(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            timeout: None,
            max_attempts: Some(max_attempts),
        }
    }

    /// Constant-interval schedule: multiplier 1 and no jitter
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.interval)
            .with_max_interval(self.interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(self.timeout)
            .build()
    }
}

/// Why a poll ended without success
#[derive(Debug)]
pub enum PollError<E> {
    /// The operation reported a permanent failure
    Aborted(E),
    /// The deadline passed; carries the last transient failure
    TimedOut { last: E, attempts: u32 },
    /// The attempt budget ran out
    Exhausted { last: E, attempts: u32 },
    /// The cancellation signal fired
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Aborted(e) => write!(f, "{}", e),
            PollError::TimedOut { last, attempts } => {
                write!(f, "timed out after {} attempts: {}", attempts, last)
            }
            PollError::Exhausted { last, attempts } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            PollError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl PollError<Error> {
    /// Collapse into a crate error for status reporting
    pub fn into_error(self, operation: &str, policy: &RetryPolicy, namespace: &str) -> Error {
        match self {
            PollError::Aborted(e) | PollError::Exhausted { last: e, .. } => e,
            PollError::TimedOut { .. } => Error::Timeout {
                operation: operation.to_string(),
                duration: policy.timeout.unwrap_or_default(),
            },
            PollError::Cancelled => Error::Cancelled {
                namespace: namespace.to_string(),
            },
        }
    }
}

/// Split crate errors into transient and permanent failures
pub fn classify(err: Error) -> backoff::Error<Error> {
    if err.is_retryable() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of budget, or
/// `cancel` fires. The first attempt runs immediately.
pub async fn poll<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, backoff::Error<E>>>,
    E: std::fmt::Display,
{
    let mut schedule = policy.schedule();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(backoff::Error::Permanent(e)) => return Err(PollError::Aborted(e)),
            Err(backoff::Error::Transient { err, .. }) => err,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(PollError::Exhausted {
                last: err,
                attempts: attempt,
            });
        }
        let Some(delay) = schedule.next_backoff() else {
            return Err(PollError::TimedOut {
                last: err,
                attempts: attempt,
            });
        };

        warn!(
            operation = %operation,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
