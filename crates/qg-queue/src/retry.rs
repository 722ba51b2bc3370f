//! Bounded connection retry with linear backoff.
//!
//! Only connection establishment is retried. Attempt `n` that fails waits
//! `base_delay * n` before attempt `n + 1`; there is no wait after the last one.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use qg_common::BackendKind;
use tracing::{info, warn};

use crate::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn linear(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }

    /// Wait applied after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(5, Duration::from_millis(1000))
    }
}

/// Call `attempt_fn` until it succeeds or `policy.attempts` calls have failed.
///
/// `attempt_fn` receives the 1-based attempt number. A policy with zero
/// attempts still makes one attempt.
pub async fn connect_with_retry<T, E, F, Fut>(
    backend: BackendKind,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<T>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match attempt_fn(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(backend = %backend, attempt, "Connected after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        backend = %backend,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(QueueError::Connection {
        backend,
        attempts,
        reason: last_error,
    })
}
