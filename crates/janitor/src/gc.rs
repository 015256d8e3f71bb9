//! Policy-driven manifest garbage collection.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use keppel_core::gc_policy::{evaluate_policies, GcDecision, GcStatus, ManifestFacts};
use keppel_core::{Digest, RegistryErrorCode};
use keppel_metadata::models::{AccountRow, RepoRow};
use keppel_metadata::repos::{AccountRepo, ManifestRepo, RepoRepo};
use keppel_metadata::MetadataError;
use std::collections::HashMap;
use time::Duration;

/// Manifest GC runs per repo at most once per hour.
pub const GC_INTERVAL: Duration = Duration::hours(1);

impl Janitor {
    /// Apply the account's GC policies to every manifest of the next due
    /// repo. The first matching policy decides each manifest's fate;
    /// `protect` shields it from later policies. Deletions go through the
    /// regular processor path, so a manifest still referenced by a parent
    /// index is deferred to a later pass (it succeeds once the parent is
    /// collected). Survivors record why they survived in `gc_status_json`.
    pub async fn collect_garbage_in_next_repo(&self) -> TaskResult {
        let now = self.now();
        let Some(repo) = self.db().claim_next_gc(now, now + CLAIM_LEASE).await? else {
            return Ok(TaskOutcome::Idle);
        };

        let result = self.collect_garbage_in_repo(&repo).await;
        match result {
            Ok(()) => {
                self.db().set_next_gc_at(repo.id, now + GC_INTERVAL).await?;
                Ok(TaskOutcome::Processed)
            }
            Err(err) => Err(err.in_context(format!(
                "while collecting garbage in repo {}",
                repo.full_name()
            ))),
        }
    }

    async fn collect_garbage_in_repo(&self, repo: &RepoRow) -> Result<(), TaskError> {
        let now = self.now();
        let account: AccountRow = self
            .db()
            .get_account(&repo.account_name)
            .await?
            .ok_or_else(|| {
                TaskError::Metadata(MetadataError::Internal(format!(
                    "repo {} references missing account",
                    repo.full_name()
                )))
            })?;
        if account.in_maintenance {
            return Ok(());
        }
        let policies = account.gc_policies()?;
        if policies.is_empty() {
            return Ok(());
        }

        let manifests = self.db().list_manifests(repo.id).await?;
        let tags = self.db().list_tags(repo.id).await?;

        // manifest digest -> names of tags pointing at it
        let mut tags_by_digest: HashMap<&str, Vec<&str>> = HashMap::new();
        for tag in &tags {
            tags_by_digest
                .entry(tag.digest.as_str())
                .or_default()
                .push(tag.name.as_str());
        }
        let pushed_at_by_digest: HashMap<&str, time::OffsetDateTime> = manifests
            .iter()
            .map(|m| (m.digest.as_str(), m.pushed_at))
            .collect();

        for manifest in &manifests {
            let labels = manifest.labels();
            let newer_tag_count = tags
                .iter()
                .filter(|tag| {
                    pushed_at_by_digest
                        .get(tag.digest.as_str())
                        .is_some_and(|pushed_at| *pushed_at > manifest.pushed_at)
                })
                .count() as u32;
            let facts = ManifestFacts {
                digest: &manifest.digest,
                pushed_at: manifest.pushed_at,
                last_pulled_at: manifest.last_pulled_at,
                tag_names: tags_by_digest
                    .get(manifest.digest.as_str())
                    .cloned()
                    .unwrap_or_default(),
                labels: &labels,
                newer_tag_count,
            };

            match evaluate_policies(&policies, &repo.name, &facts, now) {
                Some((_, GcDecision::Delete)) => {
                    let digest = Digest::parse(&manifest.digest).map_err(TaskError::from)?;
                    match self.processor().delete_manifest(&account, repo, &digest).await {
                        Ok(()) => {
                            crate::metrics::OBJECTS_SWEPT
                                .with_label_values(&["manifest"])
                                .inc();
                            tracing::info!(
                                repo = %repo.full_name(), digest = %manifest.digest,
                                "manifest deleted by GC policy"
                            );
                        }
                        Err(err)
                            if err.registry_code()
                                == Some(RegistryErrorCode::ManifestReferenced) =>
                        {
                            // still referenced by a parent index; a later
                            // pass collects it after the parent is gone
                            tracing::debug!(
                                repo = %repo.full_name(), digest = %manifest.digest,
                                "GC deferred: manifest is still referenced"
                            );
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Some((policy, GcDecision::Protect)) => {
                    let status = GcStatus {
                        protected_by_policy: Some(policy.clone()),
                        relevant_policies: Vec::new(),
                    };
                    self.write_gc_status(repo.id, &manifest.digest, &status).await?;
                }
                None => {
                    let status = GcStatus {
                        protected_by_policy: None,
                        relevant_policies: policies
                            .iter()
                            .filter(|p| p.matches_repository(&repo.name))
                            .cloned()
                            .collect(),
                    };
                    self.write_gc_status(repo.id, &manifest.digest, &status).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_gc_status(
        &self,
        repo_id: i64,
        digest: &str,
        status: &GcStatus,
    ) -> Result<(), TaskError> {
        let json = serde_json::to_string(status)
            .map_err(|e| TaskError::Metadata(MetadataError::Internal(e.to_string())))?;
        self.db().set_gc_status(repo_id, digest, &json).await?;
        Ok(())
    }
}
