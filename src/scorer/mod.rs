//! Flakiness scoring: deterministic feature extraction and score
//! composition over a rolling window of per-test occurrences.
//!
//! Pure and synchronous by design: given the same occurrence sequence
//! and policy, `score` always returns the same `FlakeScore`, independent
//! of any surrounding async machinery.

pub mod normalize;
pub mod patterns;
mod weights;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{FlakeScore, Occurrence, OccurrenceStatus, Priority, Recommendation, ScoreFeatures, TestCaseId, WorkflowRunId};

/// Scoring policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub warn_threshold: f64,
    pub quarantine_threshold: f64,
    pub min_runs_for_quarantine: usize,
    pub min_recent_failures: usize,
    pub lookback_days: i64,
    pub rolling_window_size: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            warn_threshold: 0.3,
            quarantine_threshold: 0.6,
            min_runs_for_quarantine: 5,
            min_recent_failures: 2,
            lookback_days: 7,
            rolling_window_size: 50,
        }
    }
}

/// Extracts the feature vector defined from a chronologically
/// sorted window of occurrences. Callers are expected to have already
/// applied the rolling-window cut (see [`crate::store::PersistenceStore::get_occurrence_window`]);
/// this function re-sorts defensively so it stays order-invariant on its
/// own input regardless of caller discipline.
#[must_use]
pub fn extract_features(occurrences: &[Occurrence], now: DateTime<Utc>) -> ScoreFeatures {
    let mut sorted: Vec<&Occurrence> = occurrences.iter().collect();
    sorted.sort_by_key(|o| o.created_at);

    let total_runs = sorted.len();

    let (mut passed, mut failed, mut errored) = (0u32, 0u32, 0u32);
    for o in &sorted {
        match o.status {
            OccurrenceStatus::Passed => passed += 1,
            OccurrenceStatus::Failed => failed += 1,
            OccurrenceStatus::Error => errored += 1,
            OccurrenceStatus::Skipped => {}
        }
    }
    let denom = passed + failed + errored;
    let fail_success_ratio = if denom == 0 {
        0.0
    } else {
        f64::from(failed + errored) / f64::from(denom)
    };

    let intermittency_score = intermittency(&sorted);
    let rerun_pass_rate = rerun_pass_rate(&sorted);
    let (consecutive_failures, max_consecutive_failures) = consecutive_failure_runs(&sorted);
    let message_signature_variance = message_signature_variance(&sorted);

    let days_since_first_seen = sorted
        .first()
        .map(|o| (now - o.created_at).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0);
    let avg_time_between_failures_secs = avg_time_between_failures(&sorted);

    ScoreFeatures {
        total_runs,
        fail_success_ratio,
        intermittency_score,
        rerun_pass_rate,
        consecutive_failures,
        max_consecutive_failures,
        message_signature_variance,
        days_since_first_seen,
        avg_time_between_failures_secs,
    }
}

/// Transitions between pass and fail (skipped ignored) divided by max
/// possible transitions.
fn intermittency(sorted: &[&Occurrence]) -> f64 {
    let relevant: Vec<bool> = sorted
        .iter()
        .filter(|o| !o.status.is_skipped())
        .map(|o| o.status.is_pass())
        .collect();
    if relevant.len() < 2 {
        return 0.0;
    }
    let transitions = relevant.windows(2).filter(|w| w[0] != w[1]).count();
    transitions as f64 / (relevant.len() - 1) as f64
}

/// Among workflow runs whose earliest recorded attempt failed, the share
/// with any later attempt that passed.
fn rerun_pass_rate(sorted: &[&Occurrence]) -> f64 {
    let mut by_run: HashMap<WorkflowRunId, Vec<&Occurrence>> = HashMap::new();
    for o in sorted {
        by_run.entry(o.workflow_run_id).or_default().push(o);
    }
    let mut denominator = 0usize;
    let mut numerator = 0usize;
    for occurrences in by_run.values() {
        let mut by_attempt = occurrences.clone();
        by_attempt.sort_by_key(|o| o.attempt);
        let Some(initial) = by_attempt.first() else { continue };
        if !initial.status.is_failure() {
            continue;
        }
        denominator += 1;
        if by_attempt.iter().skip(1).any(|o| o.status.is_pass()) {
            numerator += 1;
        }
    }
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Returns `(tail run length, longest run length)` of non-pass outcomes.
fn consecutive_failure_runs(sorted: &[&Occurrence]) -> (u32, u32) {
    let mut longest = 0u32;
    let mut current = 0u32;
    for o in sorted {
        if o.status.is_pass() {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    (current, longest)
}

fn message_signature_variance(sorted: &[&Occurrence]) -> f64 {
    let messages: Vec<&str> = sorted
        .iter()
        .filter(|o| o.status.is_failure())
        .filter_map(|o| o.failure_message_digest.as_deref())
        .collect();
    if messages.len() <= 1 {
        return 0.0;
    }
    let distinct: std::collections::HashSet<&str> = messages.iter().copied().collect();
    distinct.len() as f64 / messages.len() as f64
}

fn avg_time_between_failures(sorted: &[&Occurrence]) -> f64 {
    let failure_times: Vec<DateTime<Utc>> = sorted
        .iter()
        .filter(|o| o.status.is_failure())
        .map(|o| o.created_at)
        .collect();
    if failure_times.len() < 2 {
        return 0.0;
    }
    let gaps: Vec<f64> = failure_times
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64)
        .collect();
    gaps.iter().sum::<f64>() / gaps.len() as f64
}

/// Composes the fixed linear combination over the feature vector,
/// clamped to `[0, 1]` (the clamp is a no-op for any feature vector drawn
/// from the valid ranges `extract_features` produces, but is applied
/// defensively since callers may construct `ScoreFeatures` directly in
/// tests).
#[must_use]
pub fn compose_score(features: &ScoreFeatures, policy: &Policy) -> f64 {
    let window = policy.rolling_window_size.max(1) as f64;
    let normalized_consecutive = f64::from(features.consecutive_failures) / window;

    let raw = weights::FAIL_SUCCESS_RATIO * features.fail_success_ratio
        + weights::INTERMITTENCY * features.intermittency_score
        + weights::RERUN_PASS_RATE * features.rerun_pass_rate
        + weights::CONSECUTIVE_FAILURES * normalized_consecutive.min(1.0)
        + weights::MESSAGE_SIGNATURE_VARIANCE * features.message_signature_variance;

    raw.clamp(0.0, 1.0)
}

/// Confidence increases monotonically with `totalRuns` and observation
/// span, and is penalized when the test was first seen very recently.
#[must_use]
pub fn compose_confidence(features: &ScoreFeatures, policy: &Policy) -> f64 {
    let runs_component = (features.total_runs as f64 / policy.rolling_window_size.max(1) as f64).min(1.0);
    let span_component = (features.days_since_first_seen / policy.lookback_days.max(1) as f64).min(1.0);
    let mut confidence = 0.6 * runs_component + 0.4 * span_component;
    if features.days_since_first_seen * 24.0 < 1.0 {
        confidence *= 0.5;
    }
    confidence.clamp(0.0, 1.0)
}

fn recent_failure_count(occurrences: &[Occurrence], policy: &Policy, now: DateTime<Utc>) -> usize {
    let cutoff = now - chrono::Duration::days(policy.lookback_days);
    occurrences
        .iter()
        .filter(|o| o.status.is_failure() && o.created_at >= cutoff)
        .count()
}

fn recommendation_for(
    features: &ScoreFeatures,
    score: f64,
    recent_failures: usize,
    policy: &Policy,
) -> (Recommendation, Priority, String) {
    if features.total_runs < policy.min_runs_for_quarantine {
        return (
            Recommendation::None,
            Priority::Low,
            format!(
                "Insufficient data (need \u{2265} {} runs)",
                policy.min_runs_for_quarantine
            ),
        );
    }
    if recent_failures < policy.min_recent_failures {
        return (
            Recommendation::None,
            Priority::Low,
            "Too few recent failures".to_string(),
        );
    }
    if score >= policy.quarantine_threshold {
        let priority = if score > 0.85 {
            Priority::Critical
        } else if score > 0.7 {
            Priority::High
        } else {
            Priority::Medium
        };
        return (Recommendation::Quarantine, priority, "Score at or above quarantine threshold".to_string());
    }
    if score >= policy.warn_threshold {
        return (Recommendation::Warn, Priority::Medium, "Score at or above warn threshold".to_string());
    }
    (Recommendation::None, Priority::Low, "Score below warn threshold".to_string())
}

/// Produces the full [`FlakeScore`] for one test case's occurrence
/// window. `occurrences` need not be pre-sorted or pre-windowed; this is
/// the single entry point callers (the Ingestion Coordinator's
/// post-store hook, and the Recompute Orchestrator) should use.
#[must_use]
pub fn score(test_case_id: TestCaseId, occurrences: &[Occurrence], policy: &Policy, now: DateTime<Utc>) -> FlakeScore {
    let features = extract_features(occurrences, now);
    let raw_score = compose_score(&features, policy);
    let confidence = compose_confidence(&features, policy);
    let recent_failures = recent_failure_count(occurrences, policy, now);
    let (recommendation, priority, reason) = recommendation_for(&features, raw_score, recent_failures, policy);

    FlakeScore {
        test_case_id,
        score: raw_score,
        confidence,
        features,
        recommendation,
        priority,
        reason,
        computed_at: now,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::OccurrenceId;

    fn occ(
        id: i64,
        run: i64,
        status: OccurrenceStatus,
        attempt: u32,
        offset_secs: i64,
        message: Option<&str>,
    ) -> Occurrence {
        Occurrence {
            id: OccurrenceId(id),
            test_case_id: TestCaseId(1),
            workflow_run_id: WorkflowRunId(run),
            status,
            duration_ms: 10,
            attempt,
            failure_message_digest: message.map(str::to_string),
            failure_stack_digest: None,
            created_at: Utc::now() - chrono::Duration::seconds(3600 - offset_secs),
        }
    }

    #[test]
    fn stable_test_scores_zero() {
        let occurrences: Vec<Occurrence> = (0..20)
            .map(|i| occ(i, i, OccurrenceStatus::Passed, 1, i * 10, None))
            .collect();
        let result = score(TestCaseId(1), &occurrences, &Policy::default(), Utc::now());
        assert_eq!(result.score, 0.0);
        assert_eq!(result.features.fail_success_ratio, 0.0);
        assert_eq!(result.features.intermittency_score, 0.0);
        assert_eq!(result.recommendation, Recommendation::None);
    }

    #[test]
    fn broken_test_scores_below_alternating() {
        let broken: Vec<Occurrence> = (0..20)
            .map(|i| occ(i, i, OccurrenceStatus::Failed, 1, i * 10, Some("same failure")))
            .collect();
        let alternating: Vec<Occurrence> = (0..20)
            .map(|i| {
                let status = if i % 2 == 0 { OccurrenceStatus::Failed } else { OccurrenceStatus::Passed };
                occ(i, i, status, 1, i * 10, Some("same failure"))
            })
            .collect();

        let broken_score = score(TestCaseId(1), &broken, &Policy::default(), Utc::now());
        let alternating_score = score(TestCaseId(1), &alternating, &Policy::default(), Utc::now());

        assert!(broken_score.score < 0.4, "broken score {}", broken_score.score);
        assert!(alternating_score.score > 0.3, "alternating score {}", alternating_score.score);
        assert!(broken_score.score < alternating_score.score);
        assert_eq!(alternating_score.features.intermittency_score, 1.0);
    }

    #[test]
    fn retry_passing_flaky_recommends_quarantine() {
        let mut occurrences = Vec::new();
        let mut id = 0;
        for run in 0..15 {
            occurrences.push(occ(id, run, OccurrenceStatus::Failed, 1, run * 100, Some("flaky failure")));
            id += 1;
            occurrences.push(occ(id, run, OccurrenceStatus::Passed, 2, run * 100 + 5, None));
            id += 1;
        }
        let result = score(TestCaseId(1), &occurrences, &Policy::default(), Utc::now());
        assert_eq!(result.features.rerun_pass_rate, 1.0);
        assert!(result.score > 0.5, "score {}", result.score);
        assert_eq!(result.recommendation, Recommendation::Quarantine);
    }

    #[test]
    fn score_is_order_invariant() {
        let mut occurrences: Vec<Occurrence> = (0..20)
            .map(|i| {
                let status = if i % 3 == 0 { OccurrenceStatus::Failed } else { OccurrenceStatus::Passed };
                occ(i, i, status, 1, i * 10, Some("msg"))
            })
            .collect();
        let now = Utc::now();
        let forward = score(TestCaseId(1), &occurrences, &Policy::default(), now);
        occurrences.reverse();
        let reversed = score(TestCaseId(1), &occurrences, &Policy::default(), now);
        assert!((forward.score - reversed.score).abs() < 1e-9);
    }

    #[test]
    fn adding_a_rerun_pass_strictly_increases_score() {
        let policy = Policy::default();
        let now = Utc::now();
        let mut occurrences: Vec<Occurrence> = (0..10)
            .map(|i| occ(i, i, OccurrenceStatus::Failed, 1, i * 100, Some("msg")))
            .collect();
        let before = score(TestCaseId(1), &occurrences, &policy, now);

        occurrences.push(occ(100, 10, OccurrenceStatus::Failed, 1, 1000, Some("msg")));
        occurrences.push(occ(101, 10, OccurrenceStatus::Passed, 2, 1005, None));
        let after = score(TestCaseId(1), &occurrences, &policy, now);

        assert!(after.features.rerun_pass_rate > before.features.rerun_pass_rate);
        assert!(after.score > before.score);
    }

    #[test]
    fn insufficient_runs_recommends_none_with_reason() {
        let occurrences: Vec<Occurrence> = (0..3)
            .map(|i| occ(i, i, OccurrenceStatus::Failed, 1, i * 10, Some("msg")))
            .collect();
        let result = score(TestCaseId(1), &occurrences, &Policy::default(), Utc::now());
        assert_eq!(result.recommendation, Recommendation::None);
        assert!(result.reason.contains("Insufficient data"));
    }
}
