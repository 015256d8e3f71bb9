//! Periodic manifest re-validation.
//!
//! Manifests are re-checked against the current database state at most
//! every 24 hours: the stored bytes must still parse, every referenced
//! blob must still exist and be mounted, and every referenced child
//! manifest must still exist. A failure poisons the manifest (non-empty
//! `validation_error_message`), which in turn excludes its repo from the
//! blob-mount sweep.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult};
use keppel_metadata::repos::{ManifestRepo, RepoRepo};
use rand::Rng;
use time::Duration;

/// Base re-validation interval.
pub const VALIDATION_INTERVAL: Duration = Duration::hours(24);

impl Janitor {
    /// Re-validate the manifest with the oldest `validated_at` past the
    /// interval. The cutoff carries ±10% jitter so that manifests pushed
    /// in one burst do not revalidate in lockstep forever.
    pub async fn validate_next_manifest(&self) -> TaskResult {
        let jitter = rand::rng().random_range(0.9..=1.1);
        let cutoff = self.now() - Duration::seconds_f64(VALIDATION_INTERVAL.as_seconds_f64() * jitter);
        let Some(manifest) = self.db().next_manifest_to_validate(cutoff).await? else {
            return Ok(TaskOutcome::Idle);
        };

        let repo = self
            .db()
            .get_repo_by_id(manifest.repo_id)
            .await?
            .ok_or_else(|| {
                TaskError::Metadata(keppel_metadata::MetadataError::Internal(format!(
                    "manifest {} references missing repo {}",
                    manifest.digest, manifest.repo_id
                )))
            })?;

        match self.processor().check_manifest_integrity(&repo, &manifest).await {
            Ok(()) => {
                self.db()
                    .set_manifest_validation(repo.id, &manifest.digest, Some(self.now()), "")
                    .await?;
                Ok(TaskOutcome::Processed)
            }
            Err(err) => {
                // Record the cause and keep validated_at old; the loop's
                // error backoff paces retries.
                let message = err.to_string();
                self.db()
                    .set_manifest_validation(repo.id, &manifest.digest, None, &message)
                    .await?;
                Err(TaskError::Processor(err).in_context(format!(
                    "while validating manifest {} in repo {}",
                    manifest.digest,
                    repo.full_name()
                )))
            }
        }
    }
}
