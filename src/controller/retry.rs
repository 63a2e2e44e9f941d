//! Local retry for optimistic-concurrency races
//!
//! Only conflicts are retried here. Transient infrastructure failures are the
//! work queue's business and are returned to the caller untouched.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::controller::error::{BackoffConfig, Error, Result};

/// Retry budget for conflicting writes
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::conflict(),
        }
    }
}

impl ConflictRetry {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` again whenever it fails with a conflict
///
/// Each attempt must re-read whatever it writes; the closure is the unit of
/// retry. The last conflict is returned once the budget is spent.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &ConflictRetry,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_write_race(&e) && attempt + 1 < policy.max_attempts.max(1) => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_write_race(e: &Error) -> bool {
    e.is_conflict() || e.is_already_exists()
}

/// Drive `operation` unless `token` is cancelled first
///
/// The operation future is dropped on cancellation, which aborts an
/// in-flight API call.
pub async fn until_cancelled<T, Fut>(token: &CancellationToken, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}
