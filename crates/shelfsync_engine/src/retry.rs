//! Retry with exponential backoff.

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::{EngineResult, SyncError};
use tracing::warn;

/// Runs `operation`, retrying rate-limited and transient failures.
///
/// After the n-th failed attempt the wrapper sleeps `config.delay_after(n)`.
/// A rate-limit error sleeps the longer of that backoff and the server's
/// requested delay. Non-retryable errors are returned immediately; after
/// `max_attempts` the last error is returned.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub fn with_retry<T>(
    config: &RetryConfig,
    clock: &dyn Clock,
    what: &str,
    mut operation: impl FnMut() -> EngineResult<T>,
) -> EngineResult<T> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= max_attempts {
            return Err(err);
        }

        let backoff = config.delay_after(attempt);
        let delay = match &err {
            SyncError::RateLimited { retry_after } => {
                warn!(what, attempt, ?retry_after, "rate limited");
                backoff.max(*retry_after)
            }
            _ => {
                warn!(what, attempt, error = %err, "transient failure");
                backoff
            }
        };
        warn!(what, ?delay, next_attempt = attempt + 1, "retrying");

        clock.sleep(delay);
        attempt += 1;
    }
}
