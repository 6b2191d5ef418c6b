//! Async retry utilities with exponential backoff

use std::time::Duration;

/// Retry an async operation with exponential backoff.
///
/// Returns the operation's value on success, or `(error, attempts)` once
/// the attempt budget is exhausted.
pub async fn retry_with_backoff_async<F, Fut, T, E>(
    max_attempts: u32,
    base_delay_ms: u64,
    mut operation: F,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= max_attempts {
                    return Err((e, attempts));
                }
                let delay = Duration::from_millis(base_delay_ms * 2_u64.pow(attempts - 1));
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Exponential backoff delay for the n-th attempt, capped at `max_delay_ms`.
pub fn backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let exp = attempt.min(20); // avoid shift overflow on absurd attempt counts
    let delay = base_delay_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(max_delay_ms))
}
