//! Bounded Retry
//!
//! Exponential backoff with jitter for network calls and failed cycles.
//! Retries always stop after `max_retries`; whether an error is worth
//! retrying is decided by the caller.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    pub max_retries: usize,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Slow retries for whole decision cycles
    pub fn cycle() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 3.0,
            jitter_factor: 0.2,
        }
    }

    /// No delay, for tests
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter_factor > 0.0 {
            let jitter = capped * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or retries run out
    ///
    /// `hint` may override the backoff delay for an error (e.g. Retry-After);
    /// a hint longer than `max_delay` ends the retries.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
        hint: impl Fn(&E) -> Option<Duration>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_retries && retryable(&e) => {
                    let delay = match hint(&e) {
                        // not worth waiting inside the call
                        Some(wait) if wait > self.max_delay => return Err(e),
                        Some(wait) => wait,
                        None => self.delay_for_attempt(attempt),
                    };
                    warn!("{} failed (attempt {}): {}, retrying in {:?}", label, attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
