//! Bounded retries for filesystem calls that fail because another process is
//! briefly holding the target.
//!
//! A [`RetryPolicy`] bundles three things: how many times to try, how long to
//! wait between tries, and which failures count as transient. The operation
//! itself stays a plain closure, so every call site composes the policy with
//! exactly the side effect it needs.

use std::io;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::platform;

/// Delay schedule between attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Wait the same amount before every retry.
    Fixed(Duration),
    /// Start at `initial` and multiply by `multiplier` after each retry, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

/// Decides whether a failure is worth another attempt.
pub type TransientPredicate = fn(&io::Error) -> bool;

/// How a filesystem call is retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub backoff: Backoff,
    /// Failures for which another attempt is made.
    pub is_transient: TransientPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Fixed(Duration::from_millis(200)),
            is_transient: platform::is_lock_contention,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_predicate(mut self, is_transient: TransientPredicate) -> Self {
        self.is_transient = is_transient;
        self
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempts run out.
    ///
    /// Permanent failures are returned from the first attempt unchanged. When
    /// every attempt fails transiently, the last transient error is returned, so
    /// its kind is the kind the caller would have seen without retrying.
    pub fn run<T, F>(&self, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if (self.is_transient)(&err) && attempt < max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, max_attempts, ?delay, error = %err, "transient failure; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if (self.is_transient)(&err) {
                        warn!(attempts = attempt, error = %err, "giving up after transient failures");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Runs `op` under `policy`. Shorthand for [`RetryPolicy::run`].
pub fn retry<T, F>(policy: &RetryPolicy, op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    policy.run(op)
}
