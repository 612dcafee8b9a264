//! Core data-model entities shared by every subsystem.
//!
//! These are plain value types; persistence lives behind
//! [`crate::store::PersistenceStore`] and nothing in this module talks to
//! storage directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier, newtyped per entity so ids from different tables
/// cannot be mixed up at the call site.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(RepositoryId);
id_type!(WorkflowRunId);
id_type!(TestCaseId);
id_type!(OccurrenceId);
id_type!(JobId);

/// A source-code repository on the hosting platform.
///
/// Identity is `(provider, owner, name)`; `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub provider: String,
    pub owner: String,
    pub name: String,
    pub installation_id: Option<String>,
}

/// Status of a workflow run as reported by the hosting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

/// Conclusion of a terminal workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
}

/// A single execution of a workflow against one commit.
///
/// Identity is `(repo_id, external_run_id)`. Terminal once `status ==
/// Completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: WorkflowRunId,
    pub repo_id: RepositoryId,
    pub external_run_id: String,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub head_sha: String,
    pub head_branch: String,
    pub run_number: u64,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// An archive produced by a workflow run. Transient: not persisted beyond
/// the life of an ingestion job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub workflow_run_id: WorkflowRunId,
    pub name: String,
    pub size_bytes: u64,
    pub expired: bool,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

impl Artifact {
    /// Authoritative freshness check: any downloader must re-resolve the
    /// URL once `expires_at` has passed.
    #[must_use]
    pub fn url_is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.expired && now < self.expires_at
    }
}

/// A single named test, identified within its repository.
///
/// Identity: `(repo_id, suite, class_name, name)`. Created lazily on
/// first observation; lives as long as its repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestCaseId,
    pub repo_id: RepositoryId,
    pub suite: String,
    pub class_name: String,
    pub name: String,
    pub file: Option<String>,
}

/// Outcome of a single execution attempt of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceStatus {
    #[default]
    Passed,
    Failed,
    Error,
    Skipped,
}

impl OccurrenceStatus {
    /// `Error` counts as a failure for `failSuccessRatio` purposes;
    /// `Skipped` is excluded from both numerator and denominator.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    #[must_use]
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Passed)
    }

    #[must_use]
    pub fn is_skipped(self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// A single recorded execution of a [`TestCase`] within a [`WorkflowRun`].
///
/// Immutable once written: `AppendOccurrence` is the only write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub test_case_id: TestCaseId,
    pub workflow_run_id: WorkflowRunId,
    pub status: OccurrenceStatus,
    pub duration_ms: u64,
    pub attempt: u32,
    pub failure_message_digest: Option<String>,
    pub failure_stack_digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Action FlakeGuard recommends for a test based on its current score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    None,
    Warn,
    Quarantine,
}

/// Urgency tier attached to a non-`None` recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Feature vector extracted by the scorer, carried alongside the
/// score so callers can explain a recommendation without recomputing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFeatures {
    pub total_runs: usize,
    pub fail_success_ratio: f64,
    pub intermittency_score: f64,
    pub rerun_pass_rate: f64,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub message_signature_variance: f64,
    pub days_since_first_seen: f64,
    pub avg_time_between_failures_secs: f64,
}

/// The current flakiness assessment for one `TestCase`.
///
/// At most one current record per `TestCase`; prior values may be
/// archived by the store but FlakeGuard itself only ever reads/writes
/// the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakeScore {
    pub test_case_id: TestCaseId,
    pub score: f64,
    pub confidence: f64,
    pub features: ScoreFeatures,
    pub recommendation: Recommendation,
    pub priority: Priority,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

/// A temporally clustered run of failures for one `TestCase` (derived,
/// recomputed on scoring, never persisted independently of a score pass).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub test_case_id: TestCaseId,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub occurrence_ids: Vec<OccurrenceId>,
    pub intensity: f64,
}

/// Kind of background work tracked by the job queue manager. Each kind
/// gets its own queue and worker pool; see [`crate::jobs::JobQueueManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Analyze,
    Recompute,
    Poll,
    Notify,
}

/// What caused an [`IngestJob`] to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestTrigger {
    Webhook,
    Polling,
    Manual,
}

/// A request to ingest one workflow run's artifacts, as submitted by the
/// webhook handler, the poll loop, or a manual trigger. `correlation_id`
/// doubles as the job queue's idempotency key: at most one `IngestJob`
/// per `correlation_id` is ever processing at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJob {
    pub provider: String,
    pub owner: String,
    pub name: String,
    pub workflow_run_external_id: String,
    pub priority: crate::priority_queue::Priority,
    pub correlation_id: String,
    pub trigger: IngestTrigger,
}

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// In-band progress structure reported by long-running jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: String,
    pub processed: u64,
    pub total: u64,
    pub percentage: u8,
    pub current_item_name: Option<String>,
}

impl JobProgress {
    #[must_use]
    pub fn new(phase: impl Into<String>, percentage: u8) -> Self {
        Self {
            phase: phase.into(),
            processed: 0,
            total: 0,
            percentage,
            current_item_name: None,
        }
    }
}

/// A unit of background work owned by the Job Queue Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub priority: crate::priority_queue::Priority,
    pub state: JobState,
    pub correlation_id: String,
    pub progress: JobProgress,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
