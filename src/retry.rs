//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the interval to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Starts over at the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How often and how patiently to retry a fallible operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    /// Up to `attempts` tries (at least one), waiting from `initial` up to
    /// `max` between them.
    pub fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: ExponentialBackoff::new(initial, max),
        }
    }

    /// Returns the maximum number of tries.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `op` until it succeeds or the attempts are used up; the last
    /// error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff.clone();
        backoff.reset();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    tracing::warn!(
                        operation = %what,
                        attempt,
                        delay = ?backoff.current(),
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(backoff.current()).await;
                    backoff.next();
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(30))
    }
}
