//! Retry with exponential backoff for transient database failures.

use std::time::Duration;

/// Base delay between retries; doubles per attempt up to a cap.
const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_SHIFT: u32 = 6;

/// Backoff delay before retry `attempt` (1-based). Caps at 6.4s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(RETRY_MAX_SHIFT);
    Duration::from_millis(RETRY_BASE_DELAY_MS * (1u64 << shift))
}

/// Sleep out the backoff for a retry attempt, logging what we wait for.
pub async fn wait_before_retry(what: &str, attempt: u32, max_attempts: u32) {
    let delay = backoff_delay(attempt);
    tracing::warn!(
        "retrying {what} (attempt {attempt}/{max_attempts}), waiting {}ms",
        delay.as_millis()
    );
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(400));
        assert_eq!(backoff_delay(7), Duration::from_millis(6400));
        assert_eq!(backoff_delay(100), Duration::from_millis(6400));
    }
}
