//! Caller-side retry and backoff policy for Coffer
//!
//! The snapshot core never retries on its own: every operation returns its
//! first failure. Callers that want resilience wrap those operations with
//! the helpers in this crate, which retry only errors classified as transient.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Execute an operation with a custom backoff policy
///
/// Transient errors are retried until the policy gives up; the first
/// permanent error is returned immediately.
pub async fn with_custom_backoff<T, E, B, F, Fut>(
    op_name: &'static str,
    policy: B,
    mut f: F,
) -> Result<T, E>
where
    B: Backoff,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let mut attempt = 0usize;

    let operation = || {
        attempt += 1;
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);
        let fut = f();
        async move {
            fut.await.map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        }
    };

    let notify = |err: E, wait: Duration| {
        warn!(
            "Operation '{}' failed with a transient error, retrying in {:?}: {}",
            op_name, wait, err
        );
    };

    backoff::future::retry_notify(policy, operation, notify).await
}

/// Exponential backoff that gives up after a fixed number of retries
///
/// Unlike an elapsed-time budget, the count does not depend on how long each
/// attempt takes, so a single slow attempt cannot use up every retry.
#[derive(Debug, Clone)]
pub struct LimitedBackoff {
    inner: ExponentialBackoff,
    max_retries: u32,
    retries: u32,
}

impl LimitedBackoff {
    pub fn new(max_retries: u32) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(10))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();
        Self::with_policy(inner, max_retries)
    }

    pub fn with_policy(inner: ExponentialBackoff, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            retries: 0,
        }
    }
}

impl Backoff for LimitedBackoff {
    fn reset(&mut self) {
        self.retries = 0;
        self.inner.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        self.inner.next_backoff()
    }
}
