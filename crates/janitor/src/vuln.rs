//! Vulnerability status checking.
//!
//! Image manifests are handed to the scanner driver; index manifests roll
//! up their children's statuses through the status lattice. Manifests
//! whose layers are too large for the scanner report `Unsupported`, and
//! the offending blob is flagged so the size check never repeats.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use async_trait::async_trait;
use keppel_core::vuln::VulnerabilityStatus;
use keppel_core::MAX_SCANNABLE_BLOB_SIZE;
use keppel_metadata::models::{AccountRow, BlobRow, ManifestRow, RepoRow};
use keppel_metadata::repos::{AccountRepo, BlobRepo, ManifestRepo, RepoRepo};
use keppel_metadata::MetadataError;
use time::Duration;

/// Re-check interval once a manifest has a final status.
pub const VULN_CHECK_INTERVAL: Duration = Duration::hours(1);

/// Re-check interval while the status is still `Pending`.
pub const VULN_PENDING_RECHECK: Duration = Duration::minutes(30);

/// Backoff after a scanner error.
pub const VULN_ERROR_BACKOFF: Duration = Duration::minutes(10);

/// The vulnerability scanner client.
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    /// Scan a single image manifest (never an index) given its blobs.
    /// `Pending` means the scanner has accepted the manifest but has no
    /// report yet.
    async fn scan_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        manifest: &ManifestRow,
        blobs: &[BlobRow],
    ) -> Result<VulnerabilityStatus, String>;
}

/// Scanner for deployments without a scanner: everything is `Clean`.
#[derive(Debug, Default)]
pub struct TrivialScanner;

#[async_trait]
impl VulnerabilityScanner for TrivialScanner {
    async fn scan_manifest(
        &self,
        _account: &AccountRow,
        _repo: &RepoRow,
        _manifest: &ManifestRow,
        _blobs: &[BlobRow],
    ) -> Result<VulnerabilityStatus, String> {
        Ok(VulnerabilityStatus::Clean)
    }
}

impl Janitor {
    /// Check (or re-check) the vulnerability status of the next due
    /// manifest.
    pub async fn check_vulnerabilities_for_next_manifest(&self) -> TaskResult {
        let now = self.now();
        let Some(manifest) = self
            .db()
            .claim_next_vuln_check(now, now + CLAIM_LEASE)
            .await?
        else {
            return Ok(TaskOutcome::Idle);
        };

        let repo = self
            .db()
            .get_repo_by_id(manifest.repo_id)
            .await?
            .ok_or_else(|| {
                TaskError::Metadata(MetadataError::Internal(format!(
                    "manifest {} references missing repo {}",
                    manifest.digest, manifest.repo_id
                )))
            })?;
        let account = self
            .db()
            .get_account(&repo.account_name)
            .await?
            .ok_or_else(|| {
                TaskError::Metadata(MetadataError::Internal(format!(
                    "repo {} references missing account",
                    repo.full_name()
                )))
            })?;

        let result = self.check_manifest_vulnerabilities(&account, &repo, &manifest).await;
        match result {
            Ok(()) => Ok(TaskOutcome::Processed),
            Err(err) => Err(err.in_context(format!(
                "while checking vulnerabilities of manifest {} in repo {}",
                manifest.digest,
                repo.full_name()
            ))),
        }
    }

    async fn check_manifest_vulnerabilities(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        manifest: &ManifestRow,
    ) -> Result<(), TaskError> {
        let now = self.now();
        let children = self.db().child_refs(repo.id, &manifest.digest).await?;

        let status = if children.is_empty() {
            self.scan_image_manifest(account, repo, manifest).await?
        } else {
            // index manifest: merge the children's statuses
            let mut statuses = Vec::with_capacity(children.len());
            for child in &children {
                let child_manifest = self
                    .db()
                    .get_manifest(repo.id, &child.child_digest)
                    .await?
                    .ok_or_else(|| {
                        TaskError::Metadata(MetadataError::Internal(format!(
                            "index references missing manifest {}",
                            child.child_digest
                        )))
                    })?;
                statuses.push(child_manifest.vulnerability_status());
            }
            Some(VulnerabilityStatus::merge_all(statuses))
        };

        match status {
            Some(status) => {
                let next_check = if status == VulnerabilityStatus::Pending {
                    VULN_PENDING_RECHECK
                } else {
                    VULN_CHECK_INTERVAL
                };
                self.db()
                    .set_vuln_status(
                        repo.id,
                        &manifest.digest,
                        status.as_str(),
                        "",
                        Some(now + next_check),
                    )
                    .await?;
            }
            None => {
                // not ready to scan: the claim lease paces the retry
            }
        }
        Ok(())
    }

    /// Scan one image manifest. Returns `None` when the blobs are not
    /// ready yet (unvalidated); the claim lease retries later.
    async fn scan_image_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        manifest: &ManifestRow,
    ) -> Result<Option<VulnerabilityStatus>, TaskError> {
        let now = self.now();
        let blobs = self.db().blobs_for_manifest(repo.id, &manifest.digest).await?;

        for blob in &blobs {
            if !blob.validation_error_message.is_empty() {
                // poisoned blob; scanning would read garbage
                return Ok(None);
            }
            if blob.blocks_vuln_scanning == Some(true) {
                return Ok(Some(VulnerabilityStatus::Unsupported));
            }
            if blob.size_bytes > MAX_SCANNABLE_BLOB_SIZE {
                self.db().set_blocks_vuln_scanning(blob.id, true).await?;
                tracing::info!(
                    repo = %repo.full_name(), digest = %blob.digest,
                    "blob exceeds the scannable size limit; manifest is unsupported for scanning"
                );
                return Ok(Some(VulnerabilityStatus::Unsupported));
            }
        }

        match self
            .scanner()
            .scan_manifest(account, repo, manifest, &blobs)
            .await
        {
            Ok(status) => Ok(Some(status)),
            Err(message) => {
                self.db()
                    .set_vuln_status(
                        repo.id,
                        &manifest.digest,
                        VulnerabilityStatus::Error.as_str(),
                        &message,
                        Some(now + VULN_ERROR_BACKOFF),
                    )
                    .await?;
                Err(TaskError::Scanner(message))
            }
        }
    }
}
