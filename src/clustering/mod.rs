//! Temporal clustering of failure timestamps.
//!
//! No direct precedent elsewhere in this crate's original download
//! pipeline; there's no existing idiom here to imitate for this
//! particular piece of math, so the adaptive-threshold windowing below
//! is implemented directly against the clustering rules it needs to
//! satisfy.

use chrono::{DateTime, Utc};

use crate::model::OccurrenceId;

/// A run of temporally-close failures.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub occurrence_ids: Vec<OccurrenceId>,
}

/// Aggregate metrics describing how failures are distributed over time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalAnalysis {
    pub total_clusters: usize,
    pub temporal_spread_secs: f64,
    pub burstiness: f64,
    pub randomness: f64,
}

const MIN_THRESHOLD: chrono::Duration = chrono::Duration::minutes(5);
const MAX_THRESHOLD: chrono::Duration = chrono::Duration::hours(6);

/// One failure timestamp paired with the occurrence it came from, the
/// unit [`cluster`] groups.
#[derive(Debug, Clone, Copy)]
pub struct FailurePoint {
    pub occurrence_id: OccurrenceId,
    pub at: DateTime<Utc>,
}

/// Groups failure points into clusters using an adaptive inter-failure
/// gap threshold, discarding clusters with fewer than 2 members.
#[must_use]
pub fn cluster(points: &[FailurePoint]) -> Vec<Cluster> {
    if points.len() < 2 {
        return Vec::new();
    }
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|p| p.at);

    let intervals: Vec<i64> = sorted
        .windows(2)
        .map(|w| (w[1].at - w[0].at).num_seconds())
        .collect();
    let threshold = adaptive_threshold(&intervals);

    let mut clusters: Vec<Vec<FailurePoint>> = Vec::new();
    let mut current: Vec<FailurePoint> = vec![sorted[0]];
    for window in sorted.windows(2) {
        let gap = window[1].at - window[0].at;
        if gap <= threshold {
            current.push(window[1]);
        } else {
            clusters.push(std::mem::take(&mut current));
            current.push(window[1]);
        }
    }
    clusters.push(current);

    clusters
        .into_iter()
        .filter(|c| c.len() >= 2)
        .map(|members| Cluster {
            start_at: members.first().map(|p| p.at).unwrap_or_else(Utc::now),
            end_at: members.last().map(|p| p.at).unwrap_or_else(Utc::now),
            occurrence_ids: members.iter().map(|p| p.occurrence_id).collect(),
        })
        .collect()
}

fn adaptive_threshold(intervals_secs: &[i64]) -> chrono::Duration {
    if intervals_secs.is_empty() {
        return MIN_THRESHOLD;
    }
    let mut sorted = intervals_secs.to_vec();
    sorted.sort_unstable();
    let median = median_of(&sorted) as f64;
    let min = *sorted.first().unwrap_or(&0) as f64;
    let candidate = (5.0 * median).max(2.0 * min);
    let candidate = chrono::Duration::seconds(candidate.max(0.0) as i64);
    candidate.clamp(MIN_THRESHOLD, MAX_THRESHOLD)
}

fn median_of(sorted: &[i64]) -> i64 {
    let n = sorted.len();
    if n == 0 {
        return 0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2
    }
}

/// Computes the aggregate temporal metrics for a set of failure points.
/// Defined and finite even for degenerate (empty/singleton) inputs.
#[must_use]
pub fn analyze(points: &[FailurePoint]) -> TemporalAnalysis {
    if points.len() < 2 {
        return TemporalAnalysis {
            total_clusters: 0,
            temporal_spread_secs: 0.0,
            burstiness: 0.0,
            randomness: 1.0,
        };
    }
    let mut sorted = points.to_vec();
    sorted.sort_by_key(|p| p.at);
    let intervals: Vec<f64> = sorted
        .windows(2)
        .map(|w| (w[1].at - w[0].at).num_seconds() as f64)
        .collect();

    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let stddev = variance.sqrt();

    let burstiness = if stddev + mean == 0.0 {
        0.0
    } else {
        (stddev - mean) / (stddev + mean)
    };
    let randomness = (1.0 - burstiness * burstiness).clamp(0.0, 1.0);

    let spread = sorted
        .last()
        .zip(sorted.first())
        .map(|(last, first)| (last.at - first.at).num_seconds() as f64)
        .unwrap_or(0.0);

    TemporalAnalysis {
        total_clusters: cluster(points).len(),
        temporal_spread_secs: spread,
        burstiness,
        randomness,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn point(id: i64, secs_from_epoch: i64) -> FailurePoint {
        FailurePoint {
            occurrence_id: OccurrenceId(id),
            at: DateTime::from_timestamp(secs_from_epoch, 0).unwrap(),
        }
    }

    #[test]
    fn empty_input_is_defined() {
        let result = analyze(&[]);
        assert_eq!(result.total_clusters, 0);
        assert_eq!(result.randomness, 1.0);
    }

    #[test]
    fn singleton_cluster_is_discarded() {
        let points = vec![point(1, 0)];
        assert!(cluster(&points).is_empty());
    }

    #[test]
    fn close_failures_form_one_cluster() {
        let points = vec![point(1, 0), point(2, 60), point(3, 120)];
        let clusters = cluster(&points);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].occurrence_ids.len(), 3);
    }

    #[test]
    fn distant_failures_form_separate_clusters() {
        let points = vec![
            point(1, 0),
            point(2, 30),
            point(10, 100_000),
            point(11, 100_030),
        ];
        let clusters = cluster(&points);
        assert_eq!(clusters.len(), 2);
    }
}
