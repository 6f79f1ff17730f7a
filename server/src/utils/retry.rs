//! Async retry with exponential backoff

use std::future::Future;
use std::time::Duration;

/// Backoff schedule for [`retry_with_backoff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling each time
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
///
/// Returns the value and the number of attempts, or the last error and the number of attempts.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: RetryPolicy,
    is_retryable: R,
    mut operation: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempts)),
            Err(e) => {
                if attempts >= policy.max_attempts || !is_retryable(&e) {
                    return Err((e, attempts));
                }
                let delay = policy.delay_after(attempts);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
