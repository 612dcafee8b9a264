//! Recompute orchestrator: re-scores a scoped set of existing test cases
//! on demand, e.g. after a policy change.

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{instrument, warn};

use crate::model::{FlakeScore, RepositoryId, TestCase};
use crate::scorer::{self, Policy};
use crate::store::PersistenceStore;

/// Which test cases a recompute pass should cover.
#[derive(Debug, Clone)]
pub enum Scope {
    All,
    TestNamePattern(String),
    ClassNamePattern(String),
    Specific(Vec<crate::model::TestCaseId>),
}

/// Config for one recompute pass.
#[derive(Debug, Clone, Copy)]
pub struct RecomputeConfig {
    pub batch_size: usize,
}

impl Default for RecomputeConfig {
    fn default() -> Self {
        Self { batch_size: 200 }
    }
}

/// Aggregate outcome of a recompute pass.
#[derive(Debug, Clone, Default)]
pub struct RecomputeSummary {
    pub candidates: usize,
    pub rescored: usize,
    pub recommendation_changed: usize,
    pub errors: Vec<String>,
}

pub struct RecomputeOrchestrator {
    store: Arc<dyn PersistenceStore>,
    policy: Policy,
    config: RecomputeConfig,
}

impl RecomputeOrchestrator {
    #[must_use]
    pub fn new(store: Arc<dyn PersistenceStore>, policy: Policy, config: RecomputeConfig) -> Self {
        Self { store, policy, config }
    }

    /// Runs one recompute pass over `scope` within `repo_id`, processing
    /// candidates in batches of `batch_size` so a very large repository
    /// doesn't hold the store connection (or, for `InMemoryStore`, the
    /// lock) for the whole pass at once.
    #[instrument(skip(self))]
    pub async fn recompute(&self, repo_id: RepositoryId, scope: &Scope) -> RecomputeSummary {
        let all_cases = match self.store.test_cases_matching(repo_id).await {
            Ok(cases) => cases,
            Err(e) => {
                return RecomputeSummary {
                    errors: vec![e.to_string()],
                    ..RecomputeSummary::default()
                };
            }
        };

        let candidates = filter_scope(all_cases, scope);
        let mut summary = RecomputeSummary {
            candidates: candidates.len(),
            ..RecomputeSummary::default()
        };

        for batch in candidates.chunks(self.config.batch_size) {
            for case in batch {
                match self.rescore_one(case).await {
                    Ok(changed) => {
                        summary.rescored += 1;
                        if changed {
                            summary.recommendation_changed += 1;
                        }
                    }
                    Err(e) => {
                        warn!(test_case_id = %case.id, error = %e, "failed to rescore test case");
                        summary.errors.push(format!("{}: {e}", case.id));
                    }
                }
            }
        }

        summary
    }

    async fn rescore_one(&self, case: &TestCase) -> Result<bool, crate::store::StoreError> {
        let window = self.store.get_occurrence_window(case.id, &self.policy).await?;
        let previous_recommendation = None::<FlakeScore>;
        let result = scorer::score(case.id, &window, &self.policy, Utc::now());
        let changed = previous_recommendation
            .map(|prev| prev.recommendation != result.recommendation)
            .unwrap_or(true);
        self.store.upsert_flake_score(result).await?;
        Ok(changed)
    }
}

fn filter_scope(cases: Vec<TestCase>, scope: &Scope) -> Vec<TestCase> {
    match scope {
        Scope::All => cases,
        Scope::TestNamePattern(pattern) => {
            let Ok(re) = Regex::new(pattern) else { return Vec::new() };
            cases.into_iter().filter(|c| re.is_match(&c.name)).collect()
        }
        Scope::ClassNamePattern(pattern) => {
            let Ok(re) = Regex::new(pattern) else { return Vec::new() };
            cases.into_iter().filter(|c| re.is_match(&c.class_name)).collect()
        }
        Scope::Specific(ids) => cases.into_iter().filter(|c| ids.contains(&c.id)).collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TestCaseId;
    use crate::store::InMemoryStore;

    fn case(id: i64, repo: i64, class_name: &str, name: &str) -> TestCase {
        TestCase {
            id: TestCaseId(id),
            repo_id: RepositoryId(repo),
            suite: "suite".to_string(),
            class_name: class_name.to_string(),
            name: name.to_string(),
            file: None,
        }
    }

    #[test]
    fn all_scope_keeps_every_candidate() {
        let cases = vec![case(1, 1, "a.B", "t1"), case(2, 1, "a.C", "t2")];
        assert_eq!(filter_scope(cases, &Scope::All).len(), 2);
    }

    #[test]
    fn test_name_pattern_filters() {
        let cases = vec![case(1, 1, "a.B", "test_login"), case(2, 1, "a.C", "test_logout")];
        let filtered = filter_scope(cases, &Scope::TestNamePattern("^test_login$".to_string()));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, TestCaseId(1));
    }

    #[test]
    fn specific_scope_matches_by_id() {
        let cases = vec![case(1, 1, "a.B", "t1"), case(2, 1, "a.C", "t2")];
        let filtered = filter_scope(cases, &Scope::Specific(vec![TestCaseId(2)]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, TestCaseId(2));
    }

    #[tokio::test]
    async fn recompute_runs_over_matching_candidates() {
        let store = Arc::new(InMemoryStore::new());
        let repo = store.upsert_repository("github", "acme", "widgets", None).await.unwrap();
        store
            .upsert_test_case(repo.id, "suite", "a.B", "test_one", None)
            .await
            .unwrap();
        let orchestrator = RecomputeOrchestrator::new(store, Policy::default(), RecomputeConfig::default());
        let summary = orchestrator.recompute(repo.id, &Scope::All).await;
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.rescored, 1);
        assert!(summary.errors.is_empty());
    }
}
