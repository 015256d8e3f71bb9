//! Blob-mount sweep: per-repository mark-and-sweep of unreferenced blob
//! mounts.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use keppel_metadata::repos::{BlobRepo, RepoRepo};
use time::Duration;

/// Grace period between marking a mount and it becoming sweepable. Covers
/// the window where a blob is freshly mounted but its manifest has not
/// been pushed yet.
pub const MOUNT_MARK_GRACE: Duration = Duration::minutes(30);

/// Blob mounts are swept in each repo at most once per hour.
pub const MOUNT_SWEEP_INTERVAL: Duration = Duration::hours(1);

impl Janitor {
    /// Find the next repo whose blob mounts need garbage collection and
    /// perform one pass: mark all mounts not used by any manifest, unmark
    /// everything that is used again, and delete what was marked in the
    /// *previous* pass and is still marked now.
    ///
    /// The staged mark-and-sweep ensures that a mount stays alive as long
    /// as it was referenced at any point during the last full interval.
    /// The three statements run as independent transactions; the only
    /// ordering that matters is unmark strictly before sweep.
    pub async fn sweep_blob_mounts_in_next_repo(&self) -> TaskResult {
        let now = self.now();
        let Some(repo) = self
            .db()
            .claim_next_blob_mount_sweep(now, now + CLAIM_LEASE)
            .await?
        else {
            return Ok(TaskOutcome::Idle);
        };

        let result = async {
            self.db()
                .mark_unreferenced_blob_mounts(repo.id, now + MOUNT_MARK_GRACE)
                .await?;
            self.db().unmark_referenced_blob_mounts(repo.id).await?;
            let swept = self.db().sweep_marked_blob_mounts(repo.id, now).await?;
            if swept > 0 {
                crate::metrics::OBJECTS_SWEPT
                    .with_label_values(&["blob_mount"])
                    .inc_by(swept);
                tracing::info!(repo = %repo.full_name(), "{swept} blob mounts swept");
            }
            self.db()
                .set_next_blob_mount_sweep_at(repo.id, now + MOUNT_SWEEP_INTERVAL)
                .await?;
            Ok::<_, TaskError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(TaskOutcome::Processed),
            Err(err) => Err(err.in_context(format!(
                "while sweeping blob mounts in repo {}",
                repo.full_name()
            ))),
        }
    }
}
