//! Exponential backoff with full jitter, and retryable-error
//! classification.
//!
//! Grounded in this crate's original capped-exponential-backoff
//! implementation; the jitter formula is widened from additive jitter to
//! a symmetric full-jitter shape:
//! `U(0, delay) - delay * jitterFactor / 2`.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Backoff policy parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Computes `min(maxDelay, baseDelay * multiplier^(attempt-1))`, attempt
/// being 1-based.
#[must_use]
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let exp = policy.multiplier.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
    let raw_ms = policy.base_delay.as_secs_f64() * 1000.0 * exp;
    let capped_ms = raw_ms.min(policy.max_delay.as_secs_f64() * 1000.0);
    Duration::from_secs_f64((capped_ms / 1000.0).max(0.0))
}

/// Applies full jitter: `U(0, delay) - delay * jitterFactor / 2`, clamped
/// to never go negative.
#[must_use]
pub fn full_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    let delay_ms = delay.as_secs_f64() * 1000.0;
    let sampled = rand::thread_rng().gen_range(0.0..=delay_ms.max(0.0));
    let shifted = sampled - (delay_ms * jitter_factor / 2.0);
    Duration::from_secs_f64((shifted.max(0.0)) / 1000.0)
}

/// Computes the full jittered delay for `attempt` under `policy`: the
/// composition of [`backoff_delay`] and [`full_jitter`] callers reach for
/// in practice.
#[must_use]
pub fn delay_for_attempt(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = backoff_delay(attempt, policy);
    let jittered = full_jitter(base, policy.jitter_factor);
    debug!(attempt, ?base, ?jittered, "computed retry delay");
    jittered
}

/// Status codes considered retryable.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Whether an HTTP status code should be retried.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// Whether a transport-level IO error kind should be retried: connection
/// reset, host not found, connection refused, or timed out.
#[must_use]
pub fn is_retryable_io(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::NotFound
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
        };
        assert_eq!(backoff_delay(1, &policy), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, &policy), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, &policy), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, &policy), Duration::from_secs(10));
    }

    #[test]
    fn full_jitter_stays_in_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..1000 {
            let jittered = full_jitter(delay, 0.1);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn retryable_status_set_matches_contract() {
        for code in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(code));
        }
        for code in [200, 400, 401, 403, 404] {
            assert!(!is_retryable_status(code));
        }
    }
}
