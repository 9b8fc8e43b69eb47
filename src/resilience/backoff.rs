//! Exponential backoff for circuit breaker open periods.

use std::time::Duration;

/// Open-state timeout after the `failure_count`-th failure.
///
/// `base × 2^(failure_count - 1)`, capped at `max`. With `exponential` off the
/// base timeout is returned unchanged.
pub fn calculate_backoff(failure_count: u32, base: Duration, max: Duration, exponential: bool) -> Duration {
    if !exponential {
        return base;
    }
    if failure_count == 0 {
        return base.min(max);
    }

    // 2^63 seconds is already far beyond any sane cap.
    let exponent = (failure_count - 1).min(63) as i32;
    let delay_secs = base.as_secs_f64() * 2f64.powi(exponent);
    if !delay_secs.is_finite() || delay_secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(delay_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(300);

        assert_eq!(calculate_backoff(1, base, max, true), Duration::from_secs(10));
        assert_eq!(calculate_backoff(2, base, max, true), Duration::from_secs(20));
        assert_eq!(calculate_backoff(4, base, max, true), Duration::from_secs(80));
        assert_eq!(calculate_backoff(6, base, max, true), max);
        assert_eq!(calculate_backoff(u32::MAX, base, max, true), max);
    }

    #[test]
    fn flat_timeout_without_exponential() {
        let base = Duration::from_secs(10);
        assert_eq!(calculate_backoff(7, base, Duration::from_secs(300), false), base);
    }

    #[test]
    fn backoff_is_monotonic() {
        let base = Duration::from_millis(250);
        let max = Duration::from_secs(60);
        let mut previous = Duration::ZERO;
        for failures in 1..40 {
            let delay = calculate_backoff(failures, base, max, true);
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
    }
}
