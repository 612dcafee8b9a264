//! Primary + secondary rate limiting against the hosting platform.
//!
//! Generalizes this crate's original per-domain `DashMap<String,
//! Arc<DomainState>>` rate limiter (which tracked one client-side delay
//! per domain) into two cooperating trackers: a primary bucket per
//! logical resource (core / search / graphql) fed by response headers,
//! and a secondary abuse-prevention delay per endpoint that coalesces
//! concurrent callers onto one sleep, the same way the original released
//! its map guard before awaiting the per-domain mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::retry::{RetryPolicy, delay_for_attempt};

/// Config for the primary-bucket throttling policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub throttle_threshold_pct: f64,
    pub reserve_pct: f64,
    pub min_reserve: u64,
    pub max_throttle_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            throttle_threshold_pct: 20.0,
            reserve_pct: 2.0,
            min_reserve: 50,
            max_throttle_delay: Duration::from_secs(60),
        }
    }
}

/// A snapshot of the primary bucket headers for one resource.
#[derive(Debug, Clone, Copy)]
pub struct BucketState {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

/// Per-resource primary bucket, updated only by [`RateLimiter::update`].
struct ResourceState {
    remaining: AtomicU64,
    limit: AtomicU64,
    reset_at_unix: AtomicU64,
    limited: AtomicBool,
}

impl ResourceState {
    fn from_bucket(bucket: BucketState) -> Self {
        Self {
            remaining: AtomicU64::new(bucket.remaining),
            limit: AtomicU64::new(bucket.limit.max(1)),
            reset_at_unix: AtomicU64::new(u64::try_from(bucket.reset_at.timestamp().max(0)).unwrap_or(0)),
            limited: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> BucketState {
        BucketState {
            remaining: self.remaining.load(Ordering::Relaxed),
            limit: self.limit.load(Ordering::Relaxed),
            reset_at: DateTime::from_timestamp(self.reset_at_unix.load(Ordering::Relaxed) as i64, 0)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Shared per-endpoint secondary-limit sleeper: concurrent callers to the
/// same endpoint coalesce onto one `until` deadline instead of each
/// scheduling its own sleep.
struct SecondaryState {
    until_unix_ms: AtomicU64,
    notify: Notify,
}

/// Tracks and enforces primary and secondary rate limits for one upstream
/// platform.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, Arc<ResourceState>>,
    secondary: DashMap<String, Arc<SecondaryState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            secondary: DashMap::new(),
        }
    }

    /// Records the most recently observed bucket state for `resource`.
    /// This is the only mutator of primary-bucket state.
    #[instrument(skip(self))]
    pub fn update(&self, resource: &str, bucket: BucketState) {
        let floor = self.reserve_floor(bucket.limit);
        let state = Arc::new(ResourceState::from_bucket(bucket));
        state.limited.store(bucket.remaining <= floor, Ordering::Relaxed);
        self.buckets.insert(resource.to_string(), state);
    }

    fn reserve_floor(&self, limit: u64) -> u64 {
        let pct_floor = ((limit as f64) * self.config.reserve_pct / 100.0).round() as u64;
        pct_floor.max(self.config.min_reserve)
    }

    /// Blocks until the caller may proceed against `resource`, consulting
    /// the most recently observed bucket.
    #[instrument(skip(self))]
    pub async fn check(&self, resource: &str) {
        let Some(entry) = self.buckets.get(resource).map(|e| e.clone()) else {
            return;
        };
        let bucket = entry.snapshot();
        if bucket.limit == 0 {
            return;
        }
        let remaining_pct = (bucket.remaining as f64 / bucket.limit as f64) * 100.0;
        let threshold = self.config.throttle_threshold_pct;
        if remaining_pct > threshold {
            return;
        }

        let now = Utc::now();
        let reset_in = (bucket.reset_at - now).to_std().unwrap_or(Duration::ZERO);
        let throttle_intensity = ((threshold - remaining_pct) / threshold).max(0.0);
        let per_remaining_ms = reset_in.as_secs_f64() * 1000.0 / (bucket.remaining.max(1) as f64);
        let capped_ms = per_remaining_ms.min(self.config.max_throttle_delay.as_secs_f64() * 1000.0);
        let delay = Duration::from_secs_f64((capped_ms * throttle_intensity / 1000.0).max(0.0));

        if entry.limited.load(Ordering::Relaxed) {
            debug!(resource, ?reset_in, "bucket exhausted below reserve floor, waiting for reset");
            sleep(reset_in).await;
            return;
        }

        if delay > Duration::ZERO {
            debug!(resource, ?delay, remaining_pct, "throttling toward primary rate limit");
            sleep(delay).await;
        }
    }

    /// Records a secondary (abuse-prevention) limit signal for `endpoint`:
    /// a 403/429 with an optional `retry-after` hint and the attempt
    /// number that triggered it. Schedules the computed backoff;
    /// concurrent callers for the same endpoint share the wait.
    #[instrument(skip(self, policy))]
    pub fn record_secondary_limit(
        &self,
        endpoint: &str,
        retry_after: Option<Duration>,
        attempt: u32,
        policy: &RetryPolicy,
    ) {
        let delay = retry_after.unwrap_or_else(|| delay_for_attempt(attempt, policy));
        let until_ms = now_ms() + delay.as_millis() as u64;
        let state = self
            .secondary
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(SecondaryState {
                    until_unix_ms: AtomicU64::new(0),
                    notify: Notify::new(),
                })
            })
            .clone();
        state.until_unix_ms.store(until_ms, Ordering::Relaxed);
    }

    /// Waits out any active secondary-limit delay for `endpoint`.
    #[instrument(skip(self))]
    pub async fn await_secondary_limit(&self, endpoint: &str) {
        loop {
            let Some(state) = self.secondary.get(endpoint).map(|e| e.clone()) else {
                return;
            };
            let until_ms = state.until_unix_ms.load(Ordering::Relaxed);
            let now = now_ms();
            if until_ms <= now {
                return;
            }
            let remaining = Duration::from_millis(until_ms - now);
            sleep(remaining).await;
        }
    }
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis().max(0)).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_is_noop_when_resource_unseen() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.check("core").await;
    }

    #[tokio::test]
    async fn check_is_noop_well_above_threshold() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.update(
            "core",
            BucketState {
                remaining: 4000,
                limit: 5000,
                reset_at: Utc::now() + chrono::Duration::seconds(3600),
            },
        );
        let start = Instant::now();
        limiter.check("core").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn reserve_floor_uses_configured_minimum() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        // 2% of 100 is 2, below min_reserve of 50, so floor is 50.
        assert_eq!(limiter.reserve_floor(100), 50);
        // 2% of 100_000 is 2000, above min_reserve.
        assert_eq!(limiter.reserve_floor(100_000), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_limit_delays_until_window_elapses() {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.record_secondary_limit(
            "/repos/x/y/actions/runs",
            Some(Duration::from_secs(2)),
            1,
            &RetryPolicy::default(),
        );
        let start = tokio::time::Instant::now();
        limiter.await_secondary_limit("/repos/x/y/actions/runs").await;
        assert!(tokio::time::Instant::now() - start >= Duration::from_secs(2));
    }
}
