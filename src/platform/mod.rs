//! Platform client: the single point of contact with the hosting platform,
//! composing the rate limiter, circuit breaker, retry, and priority queue
//! around `reqwest`.
//!
//! Grounded on this crate's original `HttpClient` wrapper: a cloneable
//! struct around a pooled `reqwest::Client`, `#[instrument]`-annotated
//! public methods, and error classification centralized in one
//! request-sending helper. The download-specific concerns that wrapper
//! carried — resume support, filename resolution from
//! `Content-Disposition`, login-redirect detection, cookie jars — have no
//! counterpart here and are not reused.

pub mod audit;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{BreakerError, PlatformError};
use crate::ratelimit::{BucketState, RateLimiter, RateLimiterConfig};
use crate::retry::{RetryPolicy, delay_for_attempt, is_retryable_status};

/// Static configuration for one [`PlatformClient`] instance.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub base_url: String,
    pub token: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub rate_limiter: RateLimiterConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            user_agent: "flakeguard/0.1".to_string(),
            request_timeout: Duration::from_secs(30),
            rate_limiter: RateLimiterConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// An artifact as reported by the platform's list-artifacts endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteArtifact {
    pub id: i64,
    pub name: String,
    pub size_in_bytes: u64,
    pub expired: bool,
    pub archive_download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ArtifactsPage {
    artifacts: Vec<RemoteArtifact>,
}

/// A job as reported by the platform's list-jobs-for-run endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteJob {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsPage {
    jobs: Vec<RemoteJob>,
}

/// The platform client. Cloning is cheap: the inner `reqwest`
/// client, rate limiter, and circuit breaker are all reference-counted.
#[derive(Clone)]
pub struct PlatformClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    config: PlatformConfig,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
}

impl PlatformClient {
    /// Builds a client from `config`. Falls back to a plain, pool-less
    /// client if the tuned builder panics, mirroring this crate's
    /// original panic-recovery construction strategy.
    #[must_use]
    pub fn new(config: PlatformConfig) -> Self {
        let http = std::panic::catch_unwind(|| {
            reqwest::Client::builder()
                .user_agent(config.user_agent.clone())
                .timeout(config.request_timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
        })
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                http,
                limiter: RateLimiter::new(config.rate_limiter),
                breaker: Arc::new(CircuitBreaker::new("platform", config.breaker)),
                config,
            }),
        }
    }

    /// Returns the breaker instance this client's requests trip,
    /// shared (not a fresh copy) so callers like the health endpoint
    /// observe its real state.
    #[must_use]
    pub fn breaker_handle(&self) -> Arc<CircuitBreaker> {
        self.inner.breaker.clone()
    }

    /// Fetches a pre-signed artifact URL through the same rate limiter,
    /// circuit breaker, and retry policy as every other platform
    /// request, but without the platform bearer token: signed storage
    /// URLs are self-authenticating and most backing stores reject an
    /// unexpected `Authorization` header.
    ///
    /// # Errors
    /// See [`PlatformError`].
    #[instrument(skip(self), fields(endpoint, correlation_id))]
    pub async fn fetch_signed_url(
        &self,
        url: &str,
        endpoint: &str,
        correlation_id: &str,
    ) -> Result<reqwest::Response, PlatformError> {
        let result = self
            .inner
            .breaker
            .execute(|| self.send_with_retry_url("core", endpoint, reqwest::Method::GET, url, correlation_id, false))
            .await;
        unwrap_breaker(result)
    }

    /// Lists non-expired artifacts for a workflow run.
    ///
    /// # Errors
    /// See [`PlatformError`].
    #[instrument(skip(self), fields(repo, external_run_id, correlation_id))]
    pub async fn list_artifacts(
        &self,
        repo: &str,
        external_run_id: &str,
        correlation_id: &str,
    ) -> Result<Vec<RemoteArtifact>, PlatformError> {
        let path = format!("/repos/{repo}/actions/runs/{external_run_id}/artifacts");
        let page: ArtifactsPage = self
            .request_json(
                "core",
                "list_artifacts",
                reqwest::Method::GET,
                &path,
                correlation_id,
            )
            .await?;
        Ok(page.artifacts)
    }

    /// Resolves the signed, time-limited download URL for one artifact,
    /// following the platform's redirect response rather than the body.
    ///
    /// # Errors
    /// See [`PlatformError`].
    #[instrument(skip(self), fields(repo, artifact_id, correlation_id))]
    pub async fn download_artifact_url(
        &self,
        repo: &str,
        artifact_id: i64,
        correlation_id: &str,
    ) -> Result<String, PlatformError> {
        let path = format!("/repos/{repo}/actions/artifacts/{artifact_id}/zip");
        validate_path(&path)?;

        let result = self
            .inner
            .breaker
            .execute(|| self.send_with_retry("core", "download_artifact_url", reqwest::Method::GET, &path, correlation_id))
            .await;
        let response = unwrap_breaker(result)?;

        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PlatformError::request_timeout("download_artifact_url"))
    }

    /// Lists jobs attempted as part of a workflow run.
    ///
    /// # Errors
    /// See [`PlatformError`].
    #[instrument(skip(self), fields(repo, external_run_id, correlation_id))]
    pub async fn list_jobs(
        &self,
        repo: &str,
        external_run_id: &str,
        correlation_id: &str,
    ) -> Result<Vec<RemoteJob>, PlatformError> {
        let path = format!("/repos/{repo}/actions/runs/{external_run_id}/jobs");
        let page: JobsPage = self
            .request_json("core", "list_jobs", reqwest::Method::GET, &path, correlation_id)
            .await?;
        Ok(page.jobs)
    }

    /// Requests a re-run of only the failed jobs in a workflow run. The
    /// caller is expected to enqueue this at
    /// [`Priority::High`](crate::priority_queue::Priority::High) since
    /// it's a user-triggered remediation action; this method itself
    /// issues one direct platform request with no queue involvement.
    ///
    /// # Errors
    /// See [`PlatformError`].
    #[instrument(skip(self), fields(repo, external_run_id, correlation_id))]
    pub async fn rerun_failed_jobs(
        &self,
        repo: &str,
        external_run_id: &str,
        correlation_id: &str,
    ) -> Result<(), PlatformError> {
        let path = format!("/repos/{repo}/actions/runs/{external_run_id}/rerun-failed-jobs");
        validate_path(&path)?;

        let result = self
            .inner
            .breaker
            .execute(|| self.send_with_retry("core", "rerun_failed_jobs", reqwest::Method::POST, &path, correlation_id))
            .await;
        let response = unwrap_breaker(result)?;
        let record = audit::AuditRecord {
            correlation_id: correlation_id.to_string(),
            endpoint: "rerun_failed_jobs".to_string(),
            method: "POST".to_string(),
            status: Some(response.status().as_u16()),
            outcome: "ok".to_string(),
            at: Utc::now(),
        };
        audit::emit(&record, false);
        Ok(())
    }

    async fn request_json<T>(
        &self,
        resource: &str,
        endpoint: &str,
        method: reqwest::Method,
        path: &str,
        correlation_id: &str,
    ) -> Result<T, PlatformError>
    where
        T: serde::de::DeserializeOwned,
    {
        validate_path(path)?;
        let result = self
            .inner
            .breaker
            .execute(|| self.send_with_retry(resource, endpoint, method, path, correlation_id))
            .await;
        let response = unwrap_breaker(result)?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::network(endpoint, e))
    }

    /// Rate-limit-then-retry loop for a single request; the inner body of
    /// the circuit breaker's probe. Returns the raw response so callers
    /// can read headers (redirects) or decode the body as needed.
    async fn send_with_retry(
        &self,
        resource: &str,
        endpoint: &str,
        method: reqwest::Method,
        path: &str,
        correlation_id: &str,
    ) -> Result<reqwest::Response, Box<PlatformError>> {
        let url = format!("{}{}", self.inner.config.base_url, path);
        self.send_with_retry_url(resource, endpoint, method, &url, correlation_id, true).await
    }

    /// Shared retry loop for both API calls (relative `path`, joined
    /// with `base_url` by the caller) and signed-URL artifact fetches
    /// (an already-absolute `url`, unauthenticated).
    async fn send_with_retry_url(
        &self,
        resource: &str,
        endpoint: &str,
        method: reqwest::Method,
        url: &str,
        correlation_id: &str,
        authenticated: bool,
    ) -> Result<reqwest::Response, Box<PlatformError>> {
        let policy = self.inner.config.retry;
        let mut last_err = None;

        for attempt in 1..=policy.max_attempts {
            self.inner.limiter.check(resource).await;
            self.inner.limiter.await_secondary_limit(endpoint).await;

            match self.send_once(&method, url, correlation_id, authenticated).await {
                Ok(response) => {
                    self.update_bucket_from_headers(resource, &response);
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        let retry_after = retry_after_header(&response);
                        if status == StatusCode::FORBIDDEN && retry_after.is_some() {
                            self.inner
                                .limiter
                                .record_secondary_limit(endpoint, retry_after, attempt, &policy);
                        } else {
                            self.audit_failure(endpoint, &method, correlation_id, Some(status.as_u16()), true);
                            return Err(Box::new(PlatformError::authentication_failed(endpoint)));
                        }
                    }
                    if !is_retryable_status(status.as_u16()) || attempt == policy.max_attempts {
                        self.audit_failure(endpoint, &method, correlation_id, Some(status.as_u16()), false);
                        return Err(Box::new(PlatformError::request_timeout(endpoint)));
                    }
                    last_err = Some(PlatformError::request_timeout(endpoint));
                }
                Err(source) => {
                    if attempt == policy.max_attempts {
                        self.audit_failure(endpoint, &method, correlation_id, None, false);
                        return Err(Box::new(PlatformError::network(endpoint, source)));
                    }
                    last_err = Some(PlatformError::network(endpoint, source));
                }
            }

            let delay = delay_for_attempt(attempt, &policy);
            warn!(endpoint, attempt, ?delay, "retrying platform request");
            tokio::time::sleep(delay).await;
        }

        Err(Box::new(last_err.unwrap_or_else(|| PlatformError::request_timeout(endpoint))))
    }

    async fn send_once(
        &self,
        method: &reqwest::Method,
        url: &str,
        correlation_id: &str,
        authenticated: bool,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .inner
            .http
            .request(method.clone(), url)
            .header("X-Correlation-Id", correlation_id);
        if authenticated {
            builder = builder
                .bearer_auth(&self.inner.config.token)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        }
        builder.send().await
    }

    fn update_bucket_from_headers(&self, resource: &str, response: &reqwest::Response) {
        let headers = response.headers();
        let remaining = header_u64(headers, "x-ratelimit-remaining");
        let limit = header_u64(headers, "x-ratelimit-limit");
        let reset = header_u64(headers, "x-ratelimit-reset");
        if let (Some(remaining), Some(limit), Some(reset)) = (remaining, limit, reset) {
            self.inner.limiter.update(
                resource,
                BucketState {
                    remaining,
                    limit,
                    reset_at: DateTime::from_timestamp(reset as i64, 0).unwrap_or_else(Utc::now),
                },
            );
        }
    }

    fn audit_failure(
        &self,
        endpoint: &str,
        method: &reqwest::Method,
        correlation_id: &str,
        status: Option<u16>,
        security_relevant: bool,
    ) {
        let record = audit::AuditRecord {
            correlation_id: correlation_id.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status,
            outcome: "failed".to_string(),
            at: Utc::now(),
        };
        audit::emit(&record, security_relevant);
    }
}

fn validate_path(path: &str) -> Result<(), PlatformError> {
    if path.contains("..") || path.contains("//") {
        return Err(PlatformError::permission_denied(path.to_string()));
    }
    Ok(())
}

fn unwrap_breaker<T>(result: Result<T, BreakerError<Box<PlatformError>>>) -> Result<T, PlatformError> {
    match result {
        Ok(value) => Ok(value),
        Err(BreakerError::Open { label }) => Err(PlatformError::CircuitOpen(BreakerError::Open { label })),
        Err(BreakerError::Inner(boxed)) => Err(*boxed),
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// `Retry-After` is either delta-seconds or an RFC 7231 HTTP-date; GitHub
/// sends delta-seconds but the header format is otherwise server-defined.
fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    let raw = response.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    at.duration_since(std::time::SystemTime::now()).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> PlatformConfig {
        PlatformConfig {
            base_url,
            token: "test-token".to_string(),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            ..PlatformConfig::default()
        }
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_path("/repos/a/b/../../etc/passwd").is_err());
        assert!(validate_path("/repos/a//b").is_err());
        assert!(validate_path("/repos/a/b/actions/runs/1/artifacts").is_ok());
    }

    #[tokio::test]
    async fn list_artifacts_parses_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/42/artifacts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artifacts": [{
                    "id": 1,
                    "name": "junit-results",
                    "size_in_bytes": 1024,
                    "expired": false,
                    "archive_download_url": "https://example.test/archive",
                    "expires_at": "2026-01-01T00:00:00Z",
                }]
            })))
            .mount(&server)
            .await;

        let client = PlatformClient::new(test_config(server.uri()));
        let artifacts = client.list_artifacts("acme/widgets", "42", "corr-1").await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "junit-results");
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/42/jobs"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = PlatformClient::new(test_config(server.uri()));
        let result = client.list_jobs("acme/widgets", "42", "corr-2").await;
        assert!(matches!(result, Err(PlatformError::AuthenticationFailed { .. })));
    }

    #[tokio::test]
    async fn server_error_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/42/jobs"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/actions/runs/42/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "jobs": [] })))
            .mount(&server)
            .await;

        let client = PlatformClient::new(test_config(server.uri()));
        let jobs = client.list_jobs("acme/widgets", "42", "corr-3").await.unwrap();
        assert!(jobs.is_empty());
    }
}
