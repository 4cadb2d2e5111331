use crate::error::SyncError;
use crate::types::now_unix_ms;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const MAX_BACKOFF_EXPONENT: u32 = 16;
const JITTER_SPREAD_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            per_attempt_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Exponential backoff delay: `min(initial * 2^attempts, max)`.
pub(crate) fn backoff_delay(initial: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.min(MAX_BACKOFF_EXPONENT);
    let initial_ms = initial.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let delay_ms = initial_ms.saturating_mul(1_u64 << exponent);
    Duration::from_millis(delay_ms.min(max_ms))
}

// Derived from the wall clock instead of a RNG; a few ms of spread is all
// that is needed to decorrelate concurrent clients.
fn jitter_ms() -> u64 {
    now_unix_ms().unsigned_abs() % JITTER_SPREAD_MS
}

/// Runs `operation` up to `max_retries + 1` times, bounding every attempt
/// by `per_attempt_timeout`.
///
/// A timeout on the very first attempt is surfaced immediately as
/// [`SyncError::Timeout`] without further retries. Other failures are
/// retried with exponentially growing, jittered delays; once the attempt
/// budget is exhausted the last error is returned. The function holds no
/// shared state and is safe to call concurrently.
pub async fn request_with_retry<T, F, Fut>(
    options: &RetryOptions,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let timeout_ms = options.per_attempt_timeout.as_millis().min(u64::MAX as u128) as u64;
    let mut attempt: u32 = 1;

    loop {
        let error = match tokio::time::timeout(options.per_attempt_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => error,
            Err(_) if attempt == 1 => return Err(SyncError::Timeout(timeout_ms)),
            Err(_) => SyncError::Timeout(timeout_ms),
        };

        if attempt > options.max_retries {
            return Err(error);
        }

        let max_delay_ms = options.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let base_ms =
            backoff_delay(options.initial_delay, options.max_delay, attempt - 1).as_millis() as u64;
        let jittered = base_ms.saturating_add(jitter_ms()).min(max_delay_ms);
        warn!(attempt, delay_ms = jittered, error = %error, "request failed, retrying");
        tokio::time::sleep(Duration::from_millis(jittered)).await;
        attempt += 1;
    }
}
