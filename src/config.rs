//! Configuration: a `serde`-deserializable tree with defaults
//! matching every subsystem's documented default, loaded from a TOML
//! file with environment-variable overrides the way this crate's
//! original CLI layered `RUST_LOG` over its verbosity flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactHandlerConfig;
use crate::breaker::BreakerConfig;
use crate::junit::ParseLimits;
use crate::platform::PlatformConfig;
use crate::ratelimit::RateLimiterConfig;
use crate::retry::RetryPolicy;
use crate::scorer::Policy as ScorerPolicy;

fn default_queue_max_size() -> usize {
    10_000
}

fn default_worker_count() -> usize {
    4
}

fn default_job_retention_days() -> i64 {
    30
}

/// Top-level configuration, deserialized from TOML (`config.toml` by
/// convention) and overridable per field via `FLAKEGUARD_*` environment
/// variables at the call site in [`crate::config::Config::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub platform: PlatformSection,
    pub artifact: ArtifactSection,
    pub parser: ParserSection,
    pub scorer: ScorerSection,
    pub jobs: JobsSection,
    pub webhook_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: PlatformSection::default(),
            artifact: ArtifactSection::default(),
            parser: ParserSection::default(),
            scorer: ScorerSection::default(),
            jobs: JobsSection::default(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    pub base_url: String,
    pub token: String,
    pub request_timeout_secs: u64,
    pub throttle_threshold_pct: f64,
    pub reserve_pct: f64,
    pub min_reserve: u64,
    pub max_throttle_delay_secs: u64,
    pub failure_threshold: u32,
    pub rolling_window_secs: u64,
    pub open_duration_secs: u64,
    pub half_open_probes: u32,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for PlatformSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let limiter = RateLimiterConfig::default();
        let breaker = BreakerConfig::default();
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            request_timeout_secs: 30,
            throttle_threshold_pct: limiter.throttle_threshold_pct,
            reserve_pct: limiter.reserve_pct,
            min_reserve: limiter.min_reserve,
            max_throttle_delay_secs: limiter.max_throttle_delay.as_secs(),
            failure_threshold: breaker.failure_threshold,
            rolling_window_secs: breaker.rolling_window.as_secs(),
            open_duration_secs: breaker.open_duration.as_secs(),
            half_open_probes: breaker.half_open_probes,
            max_attempts: retry.max_attempts,
            base_delay_secs: retry.base_delay.as_secs(),
            max_delay_secs: retry.max_delay.as_secs(),
        }
    }
}

impl PlatformSection {
    #[must_use]
    pub fn to_platform_config(&self) -> PlatformConfig {
        PlatformConfig {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            user_agent: "flakeguard/0.1".to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            rate_limiter: RateLimiterConfig {
                throttle_threshold_pct: self.throttle_threshold_pct,
                reserve_pct: self.reserve_pct,
                min_reserve: self.min_reserve,
                max_throttle_delay: Duration::from_secs(self.max_throttle_delay_secs),
            },
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                rolling_window: Duration::from_secs(self.rolling_window_secs),
                open_duration: Duration::from_secs(self.open_duration_secs),
                half_open_probes: self.half_open_probes,
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_secs(self.base_delay_secs),
                max_delay: Duration::from_secs(self.max_delay_secs),
                multiplier: 2.0,
                jitter_factor: 0.1,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSection {
    pub max_size_bytes: u64,
    pub url_cache_ttl_secs: u64,
}

impl Default for ArtifactSection {
    fn default() -> Self {
        let defaults = ArtifactHandlerConfig::default();
        Self {
            max_size_bytes: defaults.max_size_bytes,
            url_cache_ttl_secs: defaults.url_cache_ttl.as_secs(),
        }
    }
}

impl ArtifactSection {
    #[must_use]
    pub fn to_artifact_config(&self) -> ArtifactHandlerConfig {
        ArtifactHandlerConfig {
            max_size_bytes: self.max_size_bytes,
            url_cache_ttl: Duration::from_secs(self.url_cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSection {
    pub max_file_size_bytes: u64,
    pub max_element_depth: usize,
    pub max_test_cases: usize,
}

impl Default for ParserSection {
    fn default() -> Self {
        let defaults = ParseLimits::default();
        Self {
            max_file_size_bytes: defaults.max_file_size_bytes,
            max_element_depth: defaults.max_depth,
            max_test_cases: defaults.max_test_cases,
        }
    }
}

impl ParserSection {
    #[must_use]
    pub fn to_parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_depth: self.max_element_depth,
            max_test_cases: self.max_test_cases,
            max_file_size_bytes: self.max_file_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerSection {
    pub warn_threshold: f64,
    pub quarantine_threshold: f64,
    pub min_runs_for_quarantine: usize,
    pub min_recent_failures: usize,
    pub lookback_days: i64,
    pub rolling_window_size: usize,
    pub auto_quarantine: bool,
}

impl Default for ScorerSection {
    fn default() -> Self {
        let defaults = ScorerPolicy::default();
        Self {
            warn_threshold: defaults.warn_threshold,
            quarantine_threshold: defaults.quarantine_threshold,
            min_runs_for_quarantine: defaults.min_runs_for_quarantine,
            min_recent_failures: defaults.min_recent_failures,
            lookback_days: defaults.lookback_days,
            rolling_window_size: defaults.rolling_window_size,
            auto_quarantine: false,
        }
    }
}

impl ScorerSection {
    #[must_use]
    pub fn to_policy(&self) -> ScorerPolicy {
        ScorerPolicy {
            warn_threshold: self.warn_threshold,
            quarantine_threshold: self.quarantine_threshold,
            min_runs_for_quarantine: self.min_runs_for_quarantine,
            min_recent_failures: self.min_recent_failures,
            lookback_days: self.lookback_days,
            rolling_window_size: self.rolling_window_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_job_retention_days")]
    pub retention_days: i64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            queue_max_size: default_queue_max_size(),
            worker_count: default_worker_count(),
            retention_days: default_job_retention_days(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` if it exists, falling back to
    /// defaults, then applies `FLAKEGUARD_TOKEN` and `FLAKEGUARD_WEBHOOK_SECRET`
    /// environment overrides — the same env-overrides-file precedence this
    /// crate's CLI already uses for its log level.
    ///
    /// # Errors
    /// Returns an error if `path` exists but fails to parse as TOML.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            _ => Self::default(),
        };
        if let Ok(token) = std::env::var("FLAKEGUARD_TOKEN") {
            config.platform.token = token;
        }
        if let Ok(secret) = std::env::var("FLAKEGUARD_WEBHOOK_SECRET") {
            config.webhook_secret = Some(secret);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.jobs.worker_count, config.jobs.worker_count);
    }

    #[test]
    fn platform_section_maps_durations_correctly() {
        let section = PlatformSection::default();
        let platform_config = section.to_platform_config();
        assert_eq!(platform_config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parser_section_defaults_match_parse_limits_defaults() {
        let section = ParserSection::default();
        let limits = section.to_parse_limits();
        assert_eq!(limits.max_depth, 100);
        assert_eq!(limits.max_file_size_bytes, 50 * 1024 * 1024);
    }
}
