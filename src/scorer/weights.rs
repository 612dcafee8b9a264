//! Fixed linear-combination weights for the flakiness score.
//!
//! The source this crate's scoring logic is modeled on never fixed exact
//! coefficients; only the ordering properties and the concrete
//! scenarios are binding. These weights were chosen to satisfy
//! both: an all-pass run scores exactly 0, a non-intermittent broken test
//! scores below the default warn threshold, and an alternating or
//! retry-passing flaky test clears it.

/// Weight on `failSuccessRatio`.
pub const FAIL_SUCCESS_RATIO: f64 = 0.25;
/// Weight on `intermittencyScore`, the single largest contributor since
/// it is the strongest flakiness signal (stable-broken tests don't
/// oscillate, flaky ones do).
pub const INTERMITTENCY: f64 = 0.35;
/// Weight on `rerunPassRate`.
pub const RERUN_PASS_RATE: f64 = 0.25;
/// Weight on the normalized tail run of consecutive non-pass outcomes.
pub const CONSECUTIVE_FAILURES: f64 = 0.10;
/// Weight on `messageSignatureVariance`.
pub const MESSAGE_SIGNATURE_VARIANCE: f64 = 0.05;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let sum = FAIL_SUCCESS_RATIO
            + INTERMITTENCY
            + RERUN_PASS_RATE
            + CONSECUTIVE_FAILURES
            + MESSAGE_SIGNATURE_VARIANCE;
        assert!((sum - 1.0).abs() < 1e-9, "weights must sum to 1.0, got {sum}");
    }
}
