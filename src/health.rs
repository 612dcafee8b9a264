//! Health and readiness surface: `/health`, `/health/ready`,
//! `/health/live`, plus the `/metrics` text exposition, served over a
//! minimal `axum` router since none of this is on the hot path this
//! crate's original HTTP client was built for.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

use crate::breaker::{CircuitBreaker, CircuitState};

/// What `/health` and `/health/ready` report about one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}

/// Shared state the health router reads from; holds only what's needed
/// to answer health checks; the rest of the running process (job
/// manager, platform client) stays decoupled from this module.
#[derive(Clone)]
pub struct HealthState {
    pub platform_breaker: Arc<CircuitBreaker>,
}

impl HealthState {
    fn report(&self) -> HealthReport {
        let breaker_healthy = self.platform_breaker.state() != CircuitState::Open;
        let components = vec![ComponentHealth {
            name: "platform_circuit_breaker".to_string(),
            healthy: breaker_healthy,
            detail: (!breaker_healthy).then(|| "circuit open".to_string()),
        }];
        let healthy = components.iter().all(|c| c.healthy);
        HealthReport { healthy, components }
    }
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.report();
    let status = if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    let report = state.report();
    let status = if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

/// Liveness never depends on upstream health: a process that can answer
/// HTTP at all is alive, even with its circuit breaker open.
async fn live() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_text() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], crate::metrics::render())
}

/// Builds the health/metrics router.
#[must_use]
pub fn router(state: HealthState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    #[test]
    fn healthy_when_breaker_closed() {
        let state = HealthState {
            platform_breaker: Arc::new(CircuitBreaker::new("platform", BreakerConfig::default())),
        };
        assert!(state.report().healthy);
    }
}
