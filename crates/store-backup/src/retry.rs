//! Bounded exponential backoff around remote listing and read calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BackupError, Result};

/// Retry policy: wait `base_delay * 2^attempt` after each transient failure,
/// up to `max_attempts` calls in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A policy that calls exactly once.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded on attempt {}", operation, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(BackupError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: self.max_attempts,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
