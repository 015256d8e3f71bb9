//! Storage-reconciliation bookkeeping: objects found in storage that the
//! database does not know about.

use crate::error::MetadataResult;
use crate::models::{UnknownBlobRow, UnknownManifestRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for storage-sweep tombstones.
#[async_trait]
pub trait StorageSweepRepo: Send + Sync {
    /// Record an unknown blob, keeping the existing grace deadline if the
    /// record already exists.
    async fn upsert_unknown_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn list_unknown_blobs(&self, account_name: &str)
        -> MetadataResult<Vec<UnknownBlobRow>>;

    async fn delete_unknown_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> MetadataResult<bool>;

    async fn upsert_unknown_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn list_unknown_manifests(
        &self,
        account_name: &str,
    ) -> MetadataResult<Vec<UnknownManifestRow>>;

    async fn delete_unknown_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> MetadataResult<bool>;

    /// All manifests of the account as `(repo_name, digest)` pairs, for
    /// the storage diff.
    async fn list_manifest_storage_keys(
        &self,
        account_name: &str,
    ) -> MetadataResult<Vec<(String, String)>>;
}
