//! Bounded polling against an injectable clock.
//!
//! A poll repeatedly runs a check until it reports [`Poll::Ready`], bounded by
//! an attempt count, an absolute deadline, or both. The deadline is read from
//! the clock before and after every check, independently of the poll
//! interval, so a slow check cannot stretch the loop past it. A single check
//! that never resolves is not interrupted.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use super::Clock;

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Limits for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Sleep between checks.
    pub interval: Duration,
    /// Maximum number of checks.
    pub max_attempts: Option<usize>,
    /// Absolute bound on the whole loop, measured from its start.
    pub deadline: Option<Duration>,
}

impl PollOptions {
    /// Poll at most `max_attempts` times.
    pub fn attempts(max_attempts: usize, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            deadline: None,
        }
    }

    /// Poll until `deadline` has elapsed.
    pub fn deadline(deadline: Duration, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            deadline: Some(deadline),
        }
    }
}

/// Why a polling loop gave up.
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: usize },

    #[error(transparent)]
    Check(E),
}

/// Run `check` until it is ready or the limits in `options` are reached.
///
/// The first check runs immediately. No sleep follows the final attempt.
/// A check error ends the loop at once.
pub async fn poll_until<T, E, F, Fut>(
    clock: &dyn Clock,
    options: PollOptions,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    let deadline = options.deadline.map(|d| clock.now() + d);
    let mut attempts = 0;

    loop {
        if deadline.is_some_and(|deadline| clock.now() >= deadline) {
            return Err(PollError::DeadlineExceeded { attempts });
        }

        let outcome = check().await;
        attempts += 1;

        match outcome.map_err(PollError::Check)? {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending => {}
        }

        if deadline.is_some_and(|deadline| clock.now() >= deadline) {
            return Err(PollError::DeadlineExceeded { attempts });
        }

        if options.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(PollError::Exhausted { attempts });
        }

        let pause = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(clock.now());
                options.interval.min(left)
            }
            None => options.interval,
        };
        clock.sleep(pause).await;
    }
}
