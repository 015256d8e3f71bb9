//! Blob and blob-mount repository.

use crate::error::MetadataResult;
use crate::models::{BlobMountRow, BlobRow, PendingBlobRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Fields for inserting a new blob; the id is assigned by the store.
#[derive(Clone, Debug)]
pub struct NewBlob {
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    pub storage_id: String,
    pub media_type: String,
    pub pushed_at: OffsetDateTime,
}

/// Repository for blob and blob-mount operations.
#[async_trait]
pub trait BlobRepo: Send + Sync {
    /// Insert a blob, or return the existing row when `(account, digest)`
    /// already exists. The loser of a concurrent push race gets the
    /// winner's row back and must discard its own storage object.
    async fn upsert_blob(&self, blob: &NewBlob) -> MetadataResult<BlobRow>;

    async fn get_blob(&self, account_name: &str, digest: &str)
        -> MetadataResult<Option<BlobRow>>;

    async fn get_blob_by_id(&self, id: i64) -> MetadataResult<Option<BlobRow>>;

    /// Delete a blob row. Fails on FK violation while mounts remain.
    async fn delete_blob(&self, id: i64) -> MetadataResult<bool>;

    async fn set_blob_validation(
        &self,
        id: i64,
        validated_at: Option<OffsetDateTime>,
        error_message: &str,
    ) -> MetadataResult<()>;

    async fn set_blocks_vuln_scanning(&self, id: i64, blocks: bool) -> MetadataResult<()>;

    /// Make the blob visible in the repo. Idempotent; clears any deletion
    /// mark so a re-push rescues a mount that was about to be swept.
    async fn mount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<()>;

    async fn get_blob_mount(
        &self,
        blob_id: i64,
        repo_id: i64,
    ) -> MetadataResult<Option<BlobMountRow>>;

    async fn list_blob_mounts(&self, repo_id: i64) -> MetadataResult<Vec<BlobMountRow>>;

    /// Mark phase of the blob-mount sweep: mark every unmarked mount in
    /// the repo whose blob no manifest references.
    async fn mark_unreferenced_blob_mounts(
        &self,
        repo_id: i64,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Unmark phase: clear the mark on every mount whose blob is
    /// referenced again. Must run strictly before the sweep phase.
    async fn unmark_referenced_blob_mounts(&self, repo_id: i64) -> MetadataResult<u64>;

    /// Sweep phase: delete mounts marked before `now` (i.e. marked in the
    /// previous pass and still unreferenced).
    async fn sweep_marked_blob_mounts(
        &self,
        repo_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Mark phase of the account blob sweep: mark blobs with no mount.
    async fn mark_unmounted_blobs(
        &self,
        account_name: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Unmark blobs that regained a mount.
    async fn unmark_mounted_blobs(&self, account_name: &str) -> MetadataResult<u64>;

    /// Delete blobs marked before `now`, returning the deleted rows so the
    /// caller can remove the backing storage objects.
    async fn sweep_marked_blobs(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<BlobRow>>;

    /// All storage IDs known for the account (for the storage sweep diff).
    async fn list_blob_storage_ids(&self, account_name: &str) -> MetadataResult<Vec<String>>;

    /// Blobs referenced by the given manifest, via `manifest_blob_refs`.
    async fn blobs_for_manifest(
        &self,
        repo_id: i64,
        manifest_digest: &str,
    ) -> MetadataResult<Vec<BlobRow>>;

    // --- replication markers ---

    /// Insert a pending-blob marker; `AlreadyExists` when another worker
    /// is replicating the same blob.
    async fn create_pending_blob(&self, pending: &PendingBlobRow) -> MetadataResult<()>;

    async fn get_pending_blob(
        &self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<Option<PendingBlobRow>>;

    async fn delete_pending_blob(&self, account_name: &str, digest: &str)
        -> MetadataResult<bool>;
}
