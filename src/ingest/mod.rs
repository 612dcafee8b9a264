//! Ingestion coordinator: turns one workflow run's artifacts into stored
//! occurrences and a freshly computed score per affected test.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::artifact::ArtifactHandler;
use crate::error::IngestError;
use crate::junit::{self, ParseLimits};
use crate::model::{JobProgress, Repository, WorkflowRun};
use crate::platform::{PlatformClient, RemoteArtifact};
use crate::scorer::{self, Policy};
use crate::store::PersistenceStore;

/// Names an artifact is expected to carry for FlakeGuard to consider it a
/// test-report artifact, matched case-insensitively against a substring.
const REPORT_NAME_HINTS: &[&str] = &["test", "junit", "results", "report"];

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub artifacts_considered: usize,
    pub artifacts_parsed: usize,
    pub occurrences_stored: usize,
    pub test_cases_rescored: usize,
    pub warnings: Vec<String>,
}

/// Coordinates the `discover → download → parse → store → score`
/// pipeline for one workflow run.
pub struct IngestionCoordinator {
    platform: PlatformClient,
    artifacts: Arc<ArtifactHandler>,
    store: Arc<dyn PersistenceStore>,
    policy: Policy,
    parse_limits: ParseLimits,
    artifact_max_size_bytes: u64,
}

impl IngestionCoordinator {
    #[must_use]
    pub fn new(
        platform: PlatformClient,
        artifacts: Arc<ArtifactHandler>,
        store: Arc<dyn PersistenceStore>,
        policy: Policy,
        parse_limits: ParseLimits,
        artifact_max_size_bytes: u64,
    ) -> Self {
        Self {
            platform,
            artifacts,
            store,
            policy,
            parse_limits,
            artifact_max_size_bytes,
        }
    }

    /// Ingests every qualifying artifact for `external_run_id` under
    /// `repo`, reporting phased progress through `on_progress`
    /// (discover 10%, download 25-75%, parse 75-90%, store 90-100%).
    ///
    /// Idempotent by `(repo, external_run_id)`: a repeat call upserts the
    /// same workflow run and test cases rather than duplicating them,
    /// though occurrences themselves are append-only and will duplicate
    /// if the same run is ingested twice — callers are expected to track
    /// which runs were already ingested via job state, not rely on this
    /// method to detect it.
    ///
    /// # Errors
    /// Returns [`IngestError::NoArtifacts`] only if every candidate
    /// artifact failed; individual artifact failures are otherwise
    /// recorded as warnings and do not abort the pass.
    #[instrument(skip(self, run, on_progress))]
    pub async fn ingest(
        &self,
        repo: &Repository,
        run: WorkflowRun,
        correlation_id: &str,
        mut on_progress: impl FnMut(JobProgress),
    ) -> Result<IngestSummary, IngestError> {
        on_progress(JobProgress::new("discover", 10));
        let stored_run = self
            .store
            .upsert_workflow_run(run)
            .await
            .map_err(|e| IngestError::NoArtifacts {
                external_run_id: format!("store error: {e}"),
            })?;

        let all_artifacts = self
            .platform
            .list_artifacts(&format!("{}/{}", repo.owner, repo.name), &stored_run.external_run_id, correlation_id)
            .await?;
        let candidates: Vec<RemoteArtifact> = all_artifacts
            .into_iter()
            .filter(|a| !a.expired)
            .filter(|a| a.size_in_bytes <= self.artifact_max_size_bytes)
            .filter(|a| REPORT_NAME_HINTS.iter().any(|hint| a.name.to_lowercase().contains(hint)))
            .collect();

        let mut summary = IngestSummary {
            artifacts_considered: candidates.len(),
            ..IngestSummary::default()
        };

        let total = candidates.len().max(1) as u64;
        let mut rescored = std::collections::HashSet::new();

        for (index, artifact) in candidates.into_iter().enumerate() {
            let download_pct = 25 + ((index as u64 * 50) / total) as u8;
            on_progress(JobProgress {
                processed: index as u64,
                total,
                current_item_name: Some(artifact.name.clone()),
                ..JobProgress::new("download", download_pct)
            });

            match self
                .ingest_one_artifact(repo, &stored_run, &artifact, correlation_id, &mut rescored)
                .await
            {
                Ok(occurrence_count) => {
                    summary.artifacts_parsed += 1;
                    summary.occurrences_stored += occurrence_count;
                }
                Err(reason) => {
                    warn!(artifact = %artifact.name, %reason, "skipping artifact");
                    summary.warnings.push(format!("{}: {reason}", artifact.name));
                }
            }
        }

        on_progress(JobProgress::new("store", 100));
        summary.test_cases_rescored = rescored.len();

        if summary.artifacts_considered > 0 && summary.artifacts_parsed == 0 {
            return Err(IngestError::NoArtifacts {
                external_run_id: stored_run.external_run_id,
            });
        }
        Ok(summary)
    }

    async fn ingest_one_artifact(
        &self,
        repo: &Repository,
        run: &WorkflowRun,
        artifact: &RemoteArtifact,
        correlation_id: &str,
        rescored: &mut std::collections::HashSet<crate::model::TestCaseId>,
    ) -> Result<usize, String> {
        let bytes = self
            .artifacts
            .download(&format!("{}/{}", repo.owner, repo.name), artifact.id, &artifact.name, correlation_id)
            .await
            .map_err(|e| e.to_string())?;

        let entries = extract_zip_xml_entries(&artifact.name, &bytes).map_err(|e| e.to_string())?;
        let mut stored_count = 0usize;

        for (entry_name, xml) in entries {
            let outcome = match junit::parse(&entry_name, &xml, self.parse_limits) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(entry = %entry_name, error = %e, "skipping unparseable report entry");
                    continue;
                }
            };
            if let Err(e) = outcome.validate_counts(&entry_name) {
                warn!(entry = %entry_name, error = %e, "report failed count reconciliation, storing anyway");
            }

            for parsed in outcome.occurrences() {
                let test_case = self
                    .store
                    .upsert_test_case(repo.id, &parsed.suite, &parsed.class_name, &parsed.name, None)
                    .await
                    .map_err(|e| e.to_string())?;

                let message_digest = parsed.failure_message.as_deref().map(digest);
                let stack_digest = parsed.failure_stack.as_deref().map(digest);

                self.store
                    .append_occurrence(
                        test_case.id,
                        run.id,
                        parsed.status,
                        parsed.duration_ms,
                        message_digest.as_deref(),
                        stack_digest.as_deref(),
                        run.attempt,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                stored_count += 1;
                rescored.insert(test_case.id);

                if parsed.status.is_failure() {
                    self.rescore(test_case.id).await;
                }
            }
        }
        Ok(stored_count)
    }

    async fn rescore(&self, test_case_id: crate::model::TestCaseId) {
        let Ok(window) = self.store.get_occurrence_window(test_case_id, &self.policy).await else {
            return;
        };
        let result = scorer::score(test_case_id, &window, &self.policy, Utc::now());
        if let Err(e) = self.store.upsert_flake_score(result).await {
            warn!(%e, "failed to persist flake score");
        }
    }
}

fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Extracts every `.xml` entry from a downloaded ZIP archive's bytes.
fn extract_zip_xml_entries(archive_name: &str, bytes: &[u8]) -> Result<Vec<(String, String)>, crate::error::ArtifactError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(cursor).map_err(|_| crate::error::ArtifactError::invalid_zip(archive_name))?;
    let mut entries = Vec::new();
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(|_| crate::error::ArtifactError::invalid_zip(archive_name))?;
        if !file.name().ends_with(".xml") {
            continue;
        }
        if file.name().starts_with("__MACOSX/") || file.name().ends_with(".DS_Store") {
            continue;
        }
        let name = file.name().to_string();
        let mut text = String::new();
        if std::io::Read::read_to_string(&mut file, &mut text).is_ok() {
            entries.push((name, text));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest("same message"), digest("same message"));
        assert_ne!(digest("message a"), digest("message b"));
    }

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buffer);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                std::io::Write::write_all(&mut writer, content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn extract_zip_xml_entries_skips_macosx_and_ds_store() {
        let bytes = build_zip(&[
            ("report.xml", "<testsuite/>"),
            ("__MACOSX/._report.xml", "junk"),
            (".DS_Store", "junk"),
            ("nested/other.xml", "<testsuite/>"),
        ]);
        let entries = extract_zip_xml_entries("artifact.zip", &bytes).unwrap();
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["report.xml", "nested/other.xml"]);
    }
}
