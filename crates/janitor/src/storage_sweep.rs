//! Storage reconciliation: detect and eventually remove objects that
//! exist in the storage driver but not in the database.
//!
//! Such objects appear when an upload crashes between the storage write
//! and the database commit. Each one gets a tombstone with a grace
//! deadline; if the database record has not shown up by then, the object
//! is deleted. Objects that become known again lose their tombstone.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use keppel_metadata::repos::{AccountRepo, BlobRepo, StorageSweepRepo};
use keppel_storage::{StorageDriver as _, StorageError};
use std::collections::HashSet;
use time::Duration;

/// Grace period before an unknown object may be deleted.
pub const UNKNOWN_OBJECT_GRACE: Duration = Duration::hours(4);

/// Storage contents are reconciled per account every six hours.
pub const STORAGE_SWEEP_INTERVAL: Duration = Duration::hours(6);

impl Janitor {
    /// Reconcile the next due account's storage contents with the
    /// database.
    pub async fn sweep_storage_in_next_account(&self) -> TaskResult {
        let now = self.now();
        let Some(account) = self
            .db()
            .claim_next_storage_sweep(now, now + CLAIM_LEASE)
            .await?
        else {
            return Ok(TaskOutcome::Idle);
        };

        let result = self.reconcile_account_storage(&account).await;
        match result {
            Ok(()) => {
                self.db()
                    .set_next_storage_sweep_at(&account.name, now + STORAGE_SWEEP_INTERVAL)
                    .await?;
                Ok(TaskOutcome::Processed)
            }
            Err(err) => Err(err.in_context(format!(
                "while sweeping storage of account {}",
                account.name
            ))),
        }
    }

    async fn reconcile_account_storage(
        &self,
        account: &keppel_metadata::models::AccountRow,
    ) -> Result<(), TaskError> {
        let now = self.now();
        let scope = account.scope();
        let (stored_blobs, stored_manifests) =
            self.storage().list_storage_contents(&scope).await?;

        let known_blob_ids: HashSet<String> = self
            .db()
            .list_blob_storage_ids(&account.name)
            .await?
            .into_iter()
            .collect();
        let known_manifests: HashSet<(String, String)> = self
            .db()
            .list_manifest_storage_keys(&account.name)
            .await?
            .into_iter()
            .collect();

        // Direction 1: DB rows whose storage object is gone. This cannot
        // be repaired here; it is reported so operators notice.
        let stored_blob_ids: HashSet<&str> = stored_blobs
            .iter()
            .map(|b| b.storage_id.as_str())
            .collect();
        for storage_id in &known_blob_ids {
            if !stored_blob_ids.contains(storage_id.as_str()) {
                tracing::error!(
                    account = %account.name, storage_id = %storage_id,
                    "blob exists in database but not in storage"
                );
            }
        }

        // Direction 2: storage objects the DB does not know. Tombstone
        // them now; delete them once the grace period has passed.
        for blob in &stored_blobs {
            if !known_blob_ids.contains(&blob.storage_id) {
                self.db()
                    .upsert_unknown_blob(&account.name, &blob.storage_id, now + UNKNOWN_OBJECT_GRACE)
                    .await?;
            }
        }
        for tombstone in self.db().list_unknown_blobs(&account.name).await? {
            if known_blob_ids.contains(&tombstone.storage_id) {
                // the record showed up after all
                self.db()
                    .delete_unknown_blob(&account.name, &tombstone.storage_id)
                    .await?;
            } else if tombstone.can_be_deleted_at < now {
                match self.storage().delete_blob(&scope, &tombstone.storage_id).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.db()
                    .delete_unknown_blob(&account.name, &tombstone.storage_id)
                    .await?;
                crate::metrics::OBJECTS_SWEPT
                    .with_label_values(&["unknown_blob"])
                    .inc();
                tracing::info!(
                    account = %account.name, storage_id = %tombstone.storage_id,
                    "unknown blob deleted from storage"
                );
            }
        }

        for manifest in &stored_manifests {
            let key = (manifest.repo_name.clone(), manifest.digest.clone());
            if !known_manifests.contains(&key) {
                self.db()
                    .upsert_unknown_manifest(
                        &account.name,
                        &manifest.repo_name,
                        &manifest.digest,
                        now + UNKNOWN_OBJECT_GRACE,
                    )
                    .await?;
            }
        }
        for tombstone in self.db().list_unknown_manifests(&account.name).await? {
            let key = (tombstone.repo_name.clone(), tombstone.digest.clone());
            if known_manifests.contains(&key) {
                self.db()
                    .delete_unknown_manifest(&account.name, &tombstone.repo_name, &tombstone.digest)
                    .await?;
            } else if tombstone.can_be_deleted_at < now {
                match self
                    .storage()
                    .delete_manifest(&scope, &tombstone.repo_name, &tombstone.digest)
                    .await
                {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.db()
                    .delete_unknown_manifest(&account.name, &tombstone.repo_name, &tombstone.digest)
                    .await?;
                crate::metrics::OBJECTS_SWEPT
                    .with_label_values(&["unknown_manifest"])
                    .inc();
                tracing::info!(
                    account = %account.name,
                    manifest = %format!("{}@{}", tombstone.repo_name, tombstone.digest),
                    "unknown manifest deleted from storage"
                );
            }
        }

        Ok(())
    }
}
