//! Account blob sweep: mark-and-sweep of blobs that no repository mounts
//! anymore, including deletion of their storage objects.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use keppel_metadata::repos::{AccountRepo, BlobRepo};
use keppel_storage::{StorageDriver as _, StorageError};
use time::Duration;

/// Grace period between marking a blob and it becoming sweepable.
pub const BLOB_MARK_GRACE: Duration = Duration::minutes(30);

/// Blobs are swept in each account at most once per hour.
pub const BLOB_SWEEP_INTERVAL: Duration = Duration::hours(1);

impl Janitor {
    /// Find the next account whose blobs need garbage collection: mark
    /// blobs without any mount, unmark those that gained one, delete blobs
    /// marked in the previous pass, and remove their storage objects.
    pub async fn sweep_blobs_in_next_account(&self) -> TaskResult {
        let now = self.now();
        let Some(account) = self.db().claim_next_blob_sweep(now, now + CLAIM_LEASE).await? else {
            return Ok(TaskOutcome::Idle);
        };

        let result = async {
            self.db()
                .mark_unmounted_blobs(&account.name, now + BLOB_MARK_GRACE)
                .await?;
            self.db().unmark_mounted_blobs(&account.name).await?;
            let swept = self.db().sweep_marked_blobs(&account.name, now).await?;

            let scope = account.scope();
            for blob in &swept {
                match self.storage().delete_blob(&scope, &blob.storage_id).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(TaskError::Storage(err)),
                }
            }
            if !swept.is_empty() {
                crate::metrics::OBJECTS_SWEPT
                    .with_label_values(&["blob"])
                    .inc_by(swept.len() as u64);
                tracing::info!(account = %account.name, "{} blobs swept", swept.len());
            }

            self.db()
                .set_next_blob_sweep_at(&account.name, now + BLOB_SWEEP_INTERVAL)
                .await?;
            Ok::<_, TaskError>(())
        }
        .await;

        match result {
            Ok(()) => Ok(TaskOutcome::Processed),
            Err(err) => {
                Err(err.in_context(format!("while sweeping blobs in account {}", account.name)))
            }
        }
    }
}
