//! Persistence interface.
//!
//! The relational store itself is an external collaborator outside this
//! crate's scope; only the interface it must satisfy is specified here,
//! plus an in-memory reference implementation used by this crate's own
//! tests and by callers that haven't wired a real store yet. The trait
//! is `async_trait`-object-safe the same way this crate's `dyn Resolver`
//! registry is, since callers hold it as `Arc<dyn PersistenceStore>`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::model::{
    FlakeScore, Occurrence, OccurrenceId, OccurrenceStatus, Repository, RepositoryId, TestCase,
    TestCaseId, WorkflowRun, WorkflowRunId,
};
use crate::scorer::Policy;

/// Errors a [`PersistenceStore`] implementation may raise. Concrete
/// stores (e.g. a SQL-backed one) wrap their own driver errors behind
/// this.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The six operations an ingestion/recompute pipeline needs from
/// whatever relational store backs it. All ingestion writes for
/// one workflow run are expected to happen inside a single transaction;
/// implementations that can't offer that must document the deviation.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn upsert_repository(
        &self,
        provider: &str,
        owner: &str,
        name: &str,
        installation_id: Option<&str>,
    ) -> Result<Repository, StoreError>;

    async fn upsert_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError>;

    async fn upsert_test_case(
        &self,
        repo_id: RepositoryId,
        suite: &str,
        class_name: &str,
        name: &str,
        file: Option<&str>,
    ) -> Result<TestCase, StoreError>;

    async fn append_occurrence(
        &self,
        test_case_id: TestCaseId,
        workflow_run_id: WorkflowRunId,
        status: OccurrenceStatus,
        duration_ms: u64,
        failure_message_digest: Option<&str>,
        failure_stack_digest: Option<&str>,
        attempt: u32,
    ) -> Result<Occurrence, StoreError>;

    async fn get_occurrence_window(
        &self,
        test_case_id: TestCaseId,
        policy: &Policy,
    ) -> Result<Vec<Occurrence>, StoreError>;

    async fn upsert_flake_score(&self, score: FlakeScore) -> Result<(), StoreError>;

    /// Not part of the six-operation contract directly, but required
    /// by the Recompute Orchestrator to enumerate candidates for a
    /// scope; exposed here so `InMemoryStore` can serve both roles.
    async fn test_cases_matching(&self, repo_id: RepositoryId) -> Result<Vec<TestCase>, StoreError>;
}

#[derive(Default)]
struct InMemoryData {
    repositories: Vec<Repository>,
    workflow_runs: Vec<WorkflowRun>,
    test_cases: Vec<TestCase>,
    occurrences: Vec<Occurrence>,
    scores: HashMap<TestCaseId, FlakeScore>,
    next_repo_id: i64,
    next_run_id: i64,
    next_case_id: i64,
    next_occurrence_id: i64,
}

/// In-memory reference implementation of [`PersistenceStore`], used for
/// tests and for running the pipeline without a real relational store
/// wired in.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<InMemoryData>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn upsert_repository(
        &self,
        provider: &str,
        owner: &str,
        name: &str,
        installation_id: Option<&str>,
    ) -> Result<Repository, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = data
            .repositories
            .iter()
            .find(|r| r.provider == provider && r.owner == owner && r.name == name)
            .cloned()
        {
            return Ok(existing);
        }
        data.next_repo_id += 1;
        let repo = Repository {
            id: crate::model::RepositoryId(data.next_repo_id),
            provider: provider.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            installation_id: installation_id.map(str::to_string),
        };
        data.repositories.push(repo.clone());
        Ok(repo)
    }

    async fn upsert_workflow_run(&self, run: WorkflowRun) -> Result<WorkflowRun, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = data
            .workflow_runs
            .iter_mut()
            .find(|r| r.repo_id == run.repo_id && r.external_run_id == run.external_run_id)
        {
            *existing = WorkflowRun {
                id: existing.id,
                ..run
            };
            return Ok(existing.clone());
        }
        data.next_run_id += 1;
        let stored = WorkflowRun {
            id: WorkflowRunId(data.next_run_id),
            ..run
        };
        data.workflow_runs.push(stored.clone());
        Ok(stored)
    }

    async fn upsert_test_case(
        &self,
        repo_id: RepositoryId,
        suite: &str,
        class_name: &str,
        name: &str,
        file: Option<&str>,
    ) -> Result<TestCase, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = data.test_cases.iter().find(|c| {
            c.repo_id == repo_id && c.suite == suite && c.class_name == class_name && c.name == name
        }) {
            return Ok(existing.clone());
        }
        data.next_case_id += 1;
        let case = TestCase {
            id: TestCaseId(data.next_case_id),
            repo_id,
            suite: suite.to_string(),
            class_name: class_name.to_string(),
            name: name.to_string(),
            file: file.map(str::to_string),
        };
        data.test_cases.push(case.clone());
        Ok(case)
    }

    async fn append_occurrence(
        &self,
        test_case_id: TestCaseId,
        workflow_run_id: WorkflowRunId,
        status: OccurrenceStatus,
        duration_ms: u64,
        failure_message_digest: Option<&str>,
        failure_stack_digest: Option<&str>,
        attempt: u32,
    ) -> Result<Occurrence, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data.next_occurrence_id += 1;
        let occurrence = Occurrence {
            id: OccurrenceId(data.next_occurrence_id),
            test_case_id,
            workflow_run_id,
            status,
            duration_ms,
            attempt,
            failure_message_digest: failure_message_digest.map(str::to_string),
            failure_stack_digest: failure_stack_digest.map(str::to_string),
            created_at: Utc::now(),
        };
        data.occurrences.push(occurrence.clone());
        Ok(occurrence)
    }

    async fn get_occurrence_window(
        &self,
        test_case_id: TestCaseId,
        policy: &Policy,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut matching: Vec<Occurrence> = data
            .occurrences
            .iter()
            .filter(|o| o.test_case_id == test_case_id)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.created_at);
        let window_start = matching
            .len()
            .saturating_sub(policy.rolling_window_size);
        Ok(matching.split_off(window_start))
    }

    async fn upsert_flake_score(&self, score: FlakeScore) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data.scores.insert(score.test_case_id, score);
        Ok(())
    }

    async fn test_cases_matching(&self, repo_id: RepositoryId) -> Result<Vec<TestCase>, StoreError> {
        let data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(data
            .test_cases
            .iter()
            .filter(|c| c.repo_id == repo_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_repository_is_idempotent_by_identity() {
        let store = InMemoryStore::new();
        let a = store.upsert_repository("github", "acme", "widgets", None).await.unwrap();
        let b = store.upsert_repository("github", "acme", "widgets", None).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn upsert_test_case_is_idempotent_by_identity() {
        let store = InMemoryStore::new();
        let repo = store.upsert_repository("github", "acme", "widgets", None).await.unwrap();
        let a = store
            .upsert_test_case(repo.id, "suite", "com.acme.Foo", "testBar", None)
            .await
            .unwrap();
        let b = store
            .upsert_test_case(repo.id, "suite", "com.acme.Foo", "testBar", None)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn occurrence_window_respects_rolling_window_size() {
        let store = InMemoryStore::new();
        let repo = store.upsert_repository("github", "acme", "widgets", None).await.unwrap();
        let case = store
            .upsert_test_case(repo.id, "suite", "com.acme.Foo", "testBar", None)
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_occurrence(case.id, WorkflowRunId(i), OccurrenceStatus::Passed, 10, None, None, 1)
                .await
                .unwrap();
        }
        let mut policy = Policy::default();
        policy.rolling_window_size = 3;
        let window = store.get_occurrence_window(case.id, &policy).await.unwrap();
        assert_eq!(window.len(), 3);
    }
}
