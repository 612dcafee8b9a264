//! Job queue manager: owns the lifecycle of background [`Job`]s, dispatching
//! their payloads through the in-process [`PriorityQueue`] to a worker pool.
//!
//! Worker-pool shape is grounded on this crate's original download engine,
//! which ran a fixed number of concurrent tasks pulling from a shared
//! queue behind a semaphore; here dispatch order comes from
//! [`PriorityQueue`] itself rather than a semaphore permit race, so no
//! semaphore is needed — a `JoinSet` of a configured worker count is
//! enough.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::model::{Job, JobId, JobKind, JobProgress, JobState};
use crate::priority_queue::{PriorityQueue, Priority};
use crate::retry::{RetryPolicy, delay_for_attempt};

/// Implemented once per [`JobKind`] by the code that actually knows how
/// to run that kind of job (e.g. the Ingestion Coordinator for
/// `JobKind::Ingest`).
#[async_trait]
pub trait JobHandler<P>: Send + Sync {
    async fn run(&self, payload: P, job_id: JobId, report: ProgressReporter) -> Result<(), String>;
}

/// Handed to a running [`JobHandler`] so it can push [`JobProgress`]
/// updates back into the shared registry without holding a reference to
/// the manager itself.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    registry: Arc<Mutex<HashMap<JobId, Job>>>,
}

impl ProgressReporter {
    pub fn report(&self, progress: JobProgress) {
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(job) = registry.get_mut(&self.job_id) {
            job.progress = progress;
            job.updated_at = Utc::now();
        }
    }
}

#[derive(Debug)]
struct QueuedItem<P> {
    job_id: JobId,
    payload: P,
}

/// Default retry policy for background jobs:
/// 3 attempts, 10s base delay doubling each attempt.
#[must_use]
pub fn default_job_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(5 * 60),
        multiplier: 2.0,
        jitter_factor: 0.1,
    }
}

/// Manages the lifecycle of one [`JobKind`]'s background work: an
/// in-process bounded priority queue feeding a fixed worker pool, a
/// shared registry of job state/progress, and retry-with-backoff on
/// handler failure up to [`RetryPolicy::max_attempts`].
pub struct JobQueueManager<P: Send + Clone + std::fmt::Debug + 'static> {
    queue: Arc<PriorityQueue<QueuedItem<P>>>,
    registry: Arc<Mutex<HashMap<JobId, Job>>>,
    /// Correlation ids with a job currently `Queued` or `Processing`.
    /// Enforces at most one in-flight job per correlation id.
    in_flight: Arc<Mutex<std::collections::HashSet<String>>>,
    retry_policy: RetryPolicy,
    retention: Duration,
    next_id: Arc<std::sync::atomic::AtomicI64>,
}

impl<P: Send + Clone + std::fmt::Debug + 'static> JobQueueManager<P> {
    #[must_use]
    pub fn new(max_queue_size: usize, retry_policy: RetryPolicy, retention: Duration) -> Self {
        Self {
            queue: Arc::new(PriorityQueue::new(max_queue_size)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(std::collections::HashSet::new())),
            retry_policy,
            retention,
            next_id: Arc::new(std::sync::atomic::AtomicI64::new(1)),
        }
    }

    /// Submits `payload` as a new job, returning its assigned id.
    ///
    /// # Errors
    /// Returns [`crate::error::QueueError::DuplicateCorrelationId`] if a
    /// job for `correlation_id` is already queued or processing, or
    /// [`crate::error::QueueError`] if the queue is full or shutting down.
    #[instrument(skip(self, payload))]
    pub fn submit(&self, kind: JobKind, payload: P, priority: Priority, correlation_id: &str) -> Result<JobId, crate::error::QueueError> {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if !in_flight.insert(correlation_id.to_string()) {
                return Err(crate::error::QueueError::duplicate_correlation_id(correlation_id));
            }
        }

        let id = JobId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let now = Utc::now();
        let job = Job {
            id,
            kind,
            priority,
            state: JobState::Queued,
            correlation_id: correlation_id.to_string(),
            progress: JobProgress::new("queued", 0),
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, job);
        if let Err(e) = self.queue.enqueue(QueuedItem { job_id: id, payload }, priority) {
            self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id);
            self.in_flight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(correlation_id);
            return Err(e);
        }
        Ok(id)
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&id).cloned()
    }

    /// Removes completed/failed/cancelled jobs whose `updated_at` is
    /// older than `retention`.
    pub fn prune_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        registry.retain(|_, job| {
            !matches!(job.state, JobState::Completed | JobState::Failed | JobState::Cancelled) || job.updated_at > cutoff
        });
    }

    /// Runs `worker_count` dispatch loops against `handler` until the
    /// queue shuts down. Each loop dequeues, marks the job `Processing`,
    /// invokes the handler, and on failure retries with backoff up to
    /// `max_attempts` before marking the job permanently `Failed`.
    pub async fn run_workers(self: Arc<Self>, worker_count: usize, handler: Arc<dyn JobHandler<P>>)
    where
        P: Clone,
    {
        let mut set = JoinSet::new();
        for _ in 0..worker_count {
            let manager = self.clone();
            let handler = handler.clone();
            set.spawn(async move { manager.worker_loop(handler).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn worker_loop(self: Arc<Self>, handler: Arc<dyn JobHandler<P>>)
    where
        P: Clone,
    {
        while let Some(item) = self.queue.dequeue().await {
            self.process_one(item, &handler).await;
        }
    }

    async fn process_one(&self, item: QueuedItem<P>, handler: &Arc<dyn JobHandler<P>>)
    where
        P: Clone,
    {
        {
            let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(job) = registry.get_mut(&item.job_id) {
                job.state = JobState::Processing;
                job.attempts += 1;
                job.updated_at = Utc::now();
            }
        }

        let reporter = ProgressReporter {
            job_id: item.job_id,
            registry: self.registry.clone(),
        };
        let result = handler.run(item.payload.clone(), item.job_id, reporter).await;

        let attempts = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&item.job_id)
            .map(|j| j.attempts)
            .unwrap_or(1);

        match result {
            Ok(()) => {
                self.finish(item.job_id, JobState::Completed, None);
                info!(job_id = %item.job_id, "job completed");
            }
            Err(reason) if attempts < self.retry_policy.max_attempts => {
                warn!(job_id = %item.job_id, attempts, %reason, "job failed, scheduling retry");
                self.finish(item.job_id, JobState::Queued, Some(reason));
                let delay = delay_for_attempt(attempts, &self.retry_policy);
                let priority = self.job(item.job_id).map(|j| j.priority).unwrap_or(Priority::Normal);
                let queue = self.queue.clone();
                let payload = item.payload;
                let job_id = item.job_id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = queue.enqueue(QueuedItem { job_id, payload }, priority);
                });
            }
            Err(reason) => {
                warn!(job_id = %item.job_id, attempts, %reason, "job permanently failed");
                self.finish(item.job_id, JobState::Failed, Some(reason));
            }
        }
    }

    fn finish(&self, job_id: JobId, state: JobState, error: Option<String>) {
        let mut registry = self.registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(job) = registry.get_mut(&job_id) {
            job.state = state;
            job.last_error = error;
            job.updated_at = Utc::now();
            if matches!(state, JobState::Completed | JobState::Failed | JobState::Cancelled) {
                let correlation_id = job.correlation_id.clone();
                drop(registry);
                self.in_flight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&correlation_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler<i32> for EchoHandler {
        async fn run(&self, payload: i32, _job_id: JobId, report: ProgressReporter) -> Result<(), String> {
            report.report(JobProgress::new("working", 50));
            if payload < 0 {
                Err("negative payload".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn submitted_job_completes_via_worker() {
        let manager = Arc::new(JobQueueManager::<i32>::new(10, default_job_retry_policy(), Duration::from_secs(60)));
        let id = manager.submit(JobKind::Ingest, 42, Priority::Normal, "corr-1").unwrap();

        let handle = manager.clone();
        let task = tokio::spawn(async move { handle.run_workers(1, Arc::new(EchoHandler)).await });

        for _ in 0..50 {
            if let Some(job) = manager.job(id) {
                if job.state == JobState::Completed {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.job(id).unwrap().state, JobState::Completed);
        task.abort();
    }

    #[test]
    fn rejects_second_job_for_same_correlation_id_while_in_flight() {
        let manager = JobQueueManager::<i32>::new(10, default_job_retry_policy(), Duration::from_secs(60));
        manager.submit(JobKind::Ingest, 1, Priority::Normal, "corr-dup").unwrap();
        let result = manager.submit(JobKind::Ingest, 2, Priority::Normal, "corr-dup");
        assert!(matches!(result, Err(crate::error::QueueError::DuplicateCorrelationId { .. })));
    }

    #[test]
    fn accepts_new_job_for_correlation_id_after_prior_one_finishes() {
        let manager = JobQueueManager::<i32>::new(10, default_job_retry_policy(), Duration::from_secs(60));
        let id = manager.submit(JobKind::Ingest, 1, Priority::Normal, "corr-reuse").unwrap();
        manager.finish(id, JobState::Completed, None);
        assert!(manager.submit(JobKind::Ingest, 2, Priority::Normal, "corr-reuse").is_ok());
    }

    #[test]
    fn prune_expired_removes_old_terminal_jobs() {
        let manager = JobQueueManager::<i32>::new(10, default_job_retry_policy(), Duration::from_secs(0));
        let id = manager.submit(JobKind::Ingest, 1, Priority::Low, "corr-2").unwrap();
        manager.finish(id, JobState::Completed, None);
        manager.prune_expired();
        assert!(manager.job(id).is_none());
    }
}
