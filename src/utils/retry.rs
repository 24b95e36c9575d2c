//! Backoff helper for the worker dispatcher's retry loop

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter, capped at `max_delay`.
///
/// `attempt` is 1-based. Delay is `uniform(0, min(max_delay, base * 2^(attempt-1)))`.
pub fn backoff_with_jitter(attempt: u32, base: Duration, max_delay: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let capped = exp.min(max_delay);
    let jittered_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_with_jitter_respects_cap() {
        let cap = Duration::from_secs(60);
        for attempt in 1..10 {
            let delay = backoff_with_jitter(attempt, Duration::from_secs(5), cap);
            assert!(delay <= cap);
        }
    }

    #[test]
    fn test_backoff_with_jitter_first_attempt_bounded_by_base() {
        let delay = backoff_with_jitter(1, Duration::from_secs(5), Duration::from_secs(60));
        assert!(delay <= Duration::from_secs(5));
    }
}
