//! Repository-table repository. (The table is called `repos`; a row is one
//! image repository within an account.)

use crate::error::MetadataResult;
use crate::models::RepoRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for image-repository operations.
#[async_trait]
pub trait RepoRepo: Send + Sync {
    /// Get the repo, creating it if missing. Repos are auto-created on
    /// first push.
    async fn get_or_create_repo(&self, account_name: &str, name: &str)
        -> MetadataResult<RepoRow>;

    async fn get_repo(&self, account_name: &str, name: &str) -> MetadataResult<Option<RepoRow>>;

    async fn get_repo_by_id(&self, id: i64) -> MetadataResult<Option<RepoRow>>;

    /// List repos of an account ordered by name, starting strictly after
    /// `marker`.
    async fn list_repos(
        &self,
        account_name: &str,
        marker: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<RepoRow>>;

    /// Delete a repo row. Fails on FK violation while manifests or blob
    /// mounts remain.
    async fn delete_repo(&self, id: i64) -> MetadataResult<bool>;

    /// Claim the next repo due for a blob-mount sweep. Repos containing a
    /// poisoned manifest (non-empty `validation_error_message`) are
    /// excluded: their ref lists may be incomplete, and sweeping on
    /// incomplete refs could delete mounts that are actually in use.
    async fn claim_next_blob_mount_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>>;

    async fn set_next_blob_mount_sweep_at(
        &self,
        id: i64,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Claim the next repo due for policy-driven manifest GC.
    async fn claim_next_gc(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>>;

    async fn set_next_gc_at(&self, id: i64, at: OffsetDateTime) -> MetadataResult<()>;

    /// Claim the next repo of a replica account due for a manifest sync
    /// against its upstream.
    async fn claim_next_manifest_sync(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>>;

    async fn set_next_manifest_sync_at(&self, id: i64, at: OffsetDateTime) -> MetadataResult<()>;
}
