//! FlakeGuard worker daemon entry point.
//!
//! Unlike this crate's original one-shot CLI, `flakeguardd` is a
//! long-running process: it loads configuration, wires the platform
//! client and job queue manager, starts the health/metrics HTTP surface
//! and the inbound webhook route, and runs until terminated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use flakeguard_core::artifact::ArtifactHandler;
use flakeguard_core::config::Config;
use flakeguard_core::error::QueueError;
use flakeguard_core::health::{self, HealthState};
use flakeguard_core::ingest::IngestionCoordinator;
use flakeguard_core::jobs::{JobHandler, JobQueueManager, ProgressReporter, default_job_retry_policy};
use flakeguard_core::model::{JobId, JobKind, Repository};
use flakeguard_core::platform::PlatformClient;
use flakeguard_core::platform::webhook::{self, WebhookAction};
use flakeguard_core::store::{InMemoryStore, PersistenceStore};
use tracing::{info, warn};

#[derive(Clone, Debug)]
struct IngestJobPayload {
    repo: Repository,
    external_run_id: String,
}

struct IngestJobHandler {
    coordinator: Arc<IngestionCoordinator>,
}

#[async_trait]
impl JobHandler<IngestJobPayload> for IngestJobHandler {
    async fn run(&self, payload: IngestJobPayload, job_id: JobId, report: ProgressReporter) -> Result<(), String> {
        let run = flakeguard_core::model::WorkflowRun {
            id: flakeguard_core::model::WorkflowRunId(0),
            repo_id: payload.repo.id,
            external_run_id: payload.external_run_id.clone(),
            status: flakeguard_core::model::RunStatus::Completed,
            conclusion: Some(flakeguard_core::model::RunConclusion::Failure),
            head_sha: String::new(),
            head_branch: String::new(),
            run_number: 0,
            attempt: 1,
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        };
        let correlation_id = format!("job-{job_id}");
        self.coordinator
            .ingest(&payload.repo, run, &correlation_id, |progress| report.report(progress))
            .await
            .map(|_summary| ())
            .map_err(|e| e.to_string())
    }
}

/// Shared state the webhook route reads and submits jobs through.
#[derive(Clone)]
struct WebhookState {
    job_manager: Arc<JobQueueManager<IngestJobPayload>>,
    store: Arc<dyn PersistenceStore>,
    webhook_secret: Arc<str>,
}

async fn github_webhook(State(state): State<WebhookState>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    let Some(signature) = headers.get("X-Hub-Signature-256").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing X-Hub-Signature-256 header").into_response();
    };

    let action = match webhook::handle(&body, signature, state.webhook_secret.as_bytes()) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "webhook delivery rejected");
            return (StatusCode::UNAUTHORIZED, "signature verification failed").into_response();
        }
    };

    let job = match action {
        WebhookAction::Ignored => return StatusCode::OK.into_response(),
        WebhookAction::Ingest(job) => job,
    };

    let repo = match state.store.upsert_repository(&job.provider, &job.owner, &job.name, None).await {
        Ok(repo) => repo,
        Err(e) => {
            warn!(error = %e, "failed to resolve repository for webhook ingest");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let payload = IngestJobPayload { repo, external_run_id: job.workflow_run_external_id };
    match state.job_manager.submit(JobKind::Ingest, payload, job.priority, &job.correlation_id) {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(QueueError::DuplicateCorrelationId { .. }) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to submit ingest job");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    flakeguard_core::metrics::install();

    let config_path = std::env::var("FLAKEGUARD_CONFIG").ok().map(std::path::PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(workers = config.jobs.worker_count, "flakeguardd starting");

    let platform = PlatformClient::new(config.platform.to_platform_config());
    let platform_breaker = platform.breaker_handle();
    let artifact_handler = Arc::new(ArtifactHandler::new(platform.clone(), config.artifact.to_artifact_config()));
    let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());

    let coordinator = Arc::new(IngestionCoordinator::new(
        platform,
        artifact_handler,
        store.clone(),
        config.scorer.to_policy(),
        config.parser.to_parse_limits(),
        config.artifact.max_size_bytes,
    ));

    let job_manager = Arc::new(JobQueueManager::<IngestJobPayload>::new(
        config.jobs.queue_max_size,
        default_job_retry_policy(),
        Duration::from_secs((config.jobs.retention_days * 86_400) as u64),
    ));

    let worker_handle = {
        let job_manager = job_manager.clone();
        let handler = Arc::new(IngestJobHandler { coordinator });
        tokio::spawn(async move { job_manager.run_workers(config.jobs.worker_count, handler).await })
    };

    let health_state = HealthState { platform_breaker };
    let mut app = health::router(health_state);

    match config.webhook_secret.as_deref() {
        Some(secret) => {
            let webhook_state = WebhookState { job_manager: job_manager.clone(), store, webhook_secret: Arc::from(secret) };
            let webhook_router = axum::Router::new().route("/webhooks/github", post(github_webhook)).with_state(webhook_state);
            app = app.merge(webhook_router);
        }
        None => warn!("no webhook secret configured, /webhooks/github is disabled"),
    }

    let addr: SocketAddr = "0.0.0.0:8080".parse().expect("static address parses");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health/metrics listening");

    tokio::select! {
        result = axum::serve(listener, app) => result.map_err(anyhow::Error::from)?,
        result = worker_handle => result.map_err(anyhow::Error::from)?,
    }

    Ok(())
}
