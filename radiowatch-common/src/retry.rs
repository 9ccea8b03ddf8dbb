//! Shared retry policy
//!
//! One reusable retry policy parameterized per call site (max attempts,
//! backoff schedule). Stream fetch, health probe and persistence writes all
//! go through this instead of carrying their own backoff loops.

use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Retry policy: bounded attempts with exponential backoff
///
/// **Backoff strategy:**
/// - delay doubles after each failed attempt
/// - capped at `max_delay`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Policy for database writes contending on a shared store: more
    /// attempts, short delays (locks clear quickly).
    pub fn for_database() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1000),
        }
    }

    /// Run an async operation under this policy.
    ///
    /// Retries only transient errors (`Error::is_transient`); any other error
    /// returns immediately. After the final attempt the last error is
    /// returned as-is.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let start_time = Instant::now();
        let mut delay = self.initial_delay;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tracing::debug!(operation = operation_name, attempt, "Retrying operation");
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            error = %err,
                            "Operation failed: retry attempts exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }

        // Unreachable: the loop always returns on the final attempt
        Err(Error::Internal(format!(
            "{}: retry loop exited without result",
            operation_name
        )))
    }
}
