//! Manifest, manifest-reference, and tag repository.

use crate::error::MetadataResult;
use crate::models::{ManifestManifestRefRow, ManifestRow, TagRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for manifest operations.
///
/// `create_manifest` is deliberately one fat transactional method: the
/// manifest row, its content bytes, all its references, and the quota
/// check must commit or fail as one unit (the schema invariants hold at
/// every commit point, never in between).
#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// Atomically insert or replace a manifest with its content and
    /// references, enforcing the auth tenant's manifest quota at commit
    /// time.
    ///
    /// Preconditions checked by the caller: every blob in `blob_ids` has a
    /// mount in the repo, and every digest in `child_digests` names an
    /// existing manifest in the repo. The restrict FKs back those checks
    /// up; a violation surfaces as `Constraint`.
    async fn create_manifest(
        &self,
        manifest: &ManifestRow,
        content: &[u8],
        blob_ids: &[i64],
        child_digests: &[String],
        auth_tenant_id: &str,
        manifests_limit: i64,
    ) -> MetadataResult<()>;

    async fn get_manifest(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<ManifestRow>>;

    async fn get_manifest_content(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<Vec<u8>>>;

    async fn list_manifests(&self, repo_id: i64) -> MetadataResult<Vec<ManifestRow>>;

    /// Delete a manifest. Fails with `ManifestReferenced` while a parent
    /// manifest references it; tags, refs, and content cascade away.
    /// Returns false when the manifest does not exist.
    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<bool>;

    /// Digests of manifests that reference this one as a child.
    async fn parent_digests(&self, repo_id: i64, digest: &str) -> MetadataResult<Vec<String>>;

    /// Child references of this manifest.
    async fn child_refs(
        &self,
        repo_id: i64,
        parent_digest: &str,
    ) -> MetadataResult<Vec<ManifestManifestRefRow>>;

    async fn update_manifest_pulled_at(
        &self,
        repo_id: i64,
        digest: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Count manifests across all accounts of an auth tenant.
    async fn count_manifests_for_tenant(&self, auth_tenant_id: &str) -> MetadataResult<i64>;

    // --- validation ---

    /// The manifest with the oldest `validated_at` before the cutoff, or
    /// None if everything is fresh.
    async fn next_manifest_to_validate(
        &self,
        validated_before: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>>;

    /// Record a validation outcome. On success pass `Some(now)` and an
    /// empty message; on failure pass `None` to keep the old timestamp and
    /// a terse cause.
    async fn set_manifest_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: Option<OffsetDateTime>,
        error_message: &str,
    ) -> MetadataResult<()>;

    // --- vulnerability checking ---

    /// Claim the manifest whose `next_vuln_check_at` is NULL or furthest
    /// past due, leasing it until `lease_until`.
    async fn claim_next_vuln_check(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>>;

    async fn set_vuln_status(
        &self,
        repo_id: i64,
        digest: &str,
        status: &str,
        scan_error: &str,
        next_check_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;

    // --- GC bookkeeping ---

    async fn set_gc_status(
        &self,
        repo_id: i64,
        digest: &str,
        gc_status_json: &str,
    ) -> MetadataResult<()>;

    // --- tags ---

    /// Create or move a tag. The FK to `manifests` rejects digests that
    /// don't resolve.
    async fn upsert_tag(
        &self,
        repo_id: i64,
        name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn get_tag(&self, repo_id: i64, name: &str) -> MetadataResult<Option<TagRow>>;

    async fn list_tags(&self, repo_id: i64) -> MetadataResult<Vec<TagRow>>;

    async fn tags_for_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<Vec<TagRow>>;

    async fn delete_tag(&self, repo_id: i64, name: &str) -> MetadataResult<bool>;

    async fn update_tag_pulled_at(
        &self,
        repo_id: i64,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;
}
