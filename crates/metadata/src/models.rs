//! Database models mapping to the registry schema.

use keppel_core::gc_policy::{self, GcPolicy};
use keppel_core::manifest::PlatformFilter;
use keppel_core::reference::AccountScope;
use keppel_core::vuln::VulnerabilityStatus;
use keppel_core::Result as CoreResult;
use sqlx::FromRow;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Accounts
// =============================================================================

/// Account record: the tenant-scoped root namespace.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub name: String,
    pub auth_tenant_id: String,
    /// Hostname of the peer this account replicates from; empty for
    /// primary accounts.
    pub upstream_peer_hostname: String,
    /// Credentials for replicating from an external (non-Keppel) registry.
    pub external_peer_url: String,
    pub external_peer_username: String,
    pub external_peer_password: String,
    /// Comma-separated label names that every pushed manifest must carry.
    pub required_labels: String,
    /// JSON array of platforms; when non-empty, restricts replication.
    pub platform_filter_json: String,
    pub gc_policies_json: String,
    pub metadata_json: String,
    pub in_maintenance: bool,
    pub next_blob_sweep_at: Option<OffsetDateTime>,
    pub next_storage_sweep_at: Option<OffsetDateTime>,
    pub next_federation_announcement_at: Option<OffsetDateTime>,
}

impl AccountRow {
    pub fn new(name: impl Into<String>, auth_tenant_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_tenant_id: auth_tenant_id.into(),
            upstream_peer_hostname: String::new(),
            external_peer_url: String::new(),
            external_peer_username: String::new(),
            external_peer_password: String::new(),
            required_labels: String::new(),
            platform_filter_json: String::new(),
            gc_policies_json: String::new(),
            metadata_json: String::new(),
            in_maintenance: false,
            next_blob_sweep_at: None,
            next_storage_sweep_at: None,
            next_federation_announcement_at: None,
        }
    }

    /// Whether this account replicates from elsewhere instead of taking
    /// direct pushes.
    pub fn is_replica(&self) -> bool {
        !self.upstream_peer_hostname.is_empty() || !self.external_peer_url.is_empty()
    }

    pub fn scope(&self) -> AccountScope {
        AccountScope::new(self.name.clone(), self.auth_tenant_id.clone())
    }

    pub fn required_label_names(&self) -> Vec<&str> {
        self.required_labels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn gc_policies(&self) -> CoreResult<Vec<GcPolicy>> {
        gc_policy::parse_policies(&self.gc_policies_json)
    }

    pub fn platform_filter(&self) -> CoreResult<PlatformFilter> {
        if self.platform_filter_json.is_empty() {
            return Ok(PlatformFilter::default());
        }
        serde_json::from_str(&self.platform_filter_json)
            .map_err(|e| keppel_core::Error::Serialization(e.to_string()))
    }
}

// =============================================================================
// Repositories
// =============================================================================

/// Repository record. Auto-created on first push into the repo.
#[derive(Debug, Clone, FromRow)]
pub struct RepoRow {
    pub id: i64,
    pub account_name: String,
    pub name: String,
    pub next_blob_mount_sweep_at: Option<OffsetDateTime>,
    pub next_manifest_sync_at: Option<OffsetDateTime>,
    pub next_gc_at: Option<OffsetDateTime>,
}

impl RepoRow {
    /// The image reference prefix, e.g. `test1/library/alpine`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}

// =============================================================================
// Blobs and blob mounts
// =============================================================================

/// Blob record. Identity is `(account_name, digest)`; two repos of the
/// same account sharing a layer share one row and one storage object.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    pub storage_id: String,
    pub media_type: String,
    pub pushed_at: OffsetDateTime,
    pub validated_at: OffsetDateTime,
    pub validation_error_message: String,
    pub can_be_deleted_at: Option<OffsetDateTime>,
    /// NULL = not yet checked; true = too large for the scanner.
    pub blocks_vuln_scanning: Option<bool>,
}

/// Blob mount: makes a blob reachable through a repository path. The only
/// way a blob is visible in a repo.
#[derive(Debug, Clone, FromRow)]
pub struct BlobMountRow {
    pub blob_id: i64,
    pub repo_id: i64,
    pub can_be_deleted_at: Option<OffsetDateTime>,
}

// =============================================================================
// Manifests, refs, tags
// =============================================================================

/// Manifest record. Content bytes live in `manifest_contents`.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRow {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: OffsetDateTime,
    pub validated_at: OffsetDateTime,
    pub validation_error_message: String,
    pub last_pulled_at: Option<OffsetDateTime>,
    pub next_vuln_check_at: Option<OffsetDateTime>,
    pub vuln_status: String,
    pub vuln_scan_error: String,
    pub labels_json: String,
    pub gc_status_json: String,
    pub min_layer_created_at: Option<OffsetDateTime>,
    pub max_layer_created_at: Option<OffsetDateTime>,
}

impl ManifestRow {
    pub fn vulnerability_status(&self) -> VulnerabilityStatus {
        self.vuln_status
            .parse()
            .unwrap_or(VulnerabilityStatus::Pending)
    }

    pub fn labels(&self) -> HashMap<String, String> {
        if self.labels_json.is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&self.labels_json).unwrap_or_default()
    }

    /// Whether this manifest failed its last validation.
    pub fn is_poisoned(&self) -> bool {
        !self.validation_error_message.is_empty()
    }
}

/// Parent-manifest → blob reference.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestBlobRefRow {
    pub repo_id: i64,
    pub digest: String,
    pub blob_id: i64,
}

/// Parent-manifest → child-manifest reference (image index member).
#[derive(Debug, Clone, FromRow)]
pub struct ManifestManifestRefRow {
    pub repo_id: i64,
    pub parent_digest: String,
    pub child_digest: String,
}

/// Tag: a mutable name pointing at a manifest digest.
#[derive(Debug, Clone, FromRow)]
pub struct TagRow {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: OffsetDateTime,
    pub last_pulled_at: Option<OffsetDateTime>,
}

// =============================================================================
// Uploads
// =============================================================================

/// In-flight chunked blob upload.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub repo_id: i64,
    pub uuid: Uuid,
    pub storage_id: String,
    pub size_bytes: i64,
    /// Digest of the bytes received so far (hex state is not persisted;
    /// this holds the client-declared digest once known).
    pub digest: String,
    pub num_chunks: i32,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Quotas and peers
// =============================================================================

/// Manifest quota per auth tenant. Absence of a row means quota 0.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaRow {
    pub auth_tenant_id: String,
    pub manifests: i64,
}

/// Mutual-peering credentials with one-step rotation history.
#[derive(Debug, Clone, FromRow)]
pub struct PeerRow {
    pub hostname: String,
    /// The password we present when talking to this peer.
    pub our_password: String,
    /// Hash of the password the peer currently presents to us.
    pub their_current_password_hash: String,
    /// Previous hash, still accepted to bridge rotation races.
    pub their_previous_password_hash: String,
    pub last_peered_at: Option<OffsetDateTime>,
}

// =============================================================================
// Replication and storage-sweep bookkeeping
// =============================================================================

/// Marker for a blob replication in progress.
#[derive(Debug, Clone, FromRow)]
pub struct PendingBlobRow {
    pub account_name: String,
    pub digest: String,
    pub reason: String,
    pub since: OffsetDateTime,
}

/// A blob found in storage with no matching database record; deleted after
/// a grace period unless the record shows up.
#[derive(Debug, Clone, FromRow)]
pub struct UnknownBlobRow {
    pub account_name: String,
    pub storage_id: String,
    pub can_be_deleted_at: OffsetDateTime,
}

/// Same, for manifests.
#[derive(Debug, Clone, FromRow)]
pub struct UnknownManifestRow {
    pub account_name: String,
    pub repo_name: String,
    pub digest: String,
    pub can_be_deleted_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_helpers() {
        let mut account = AccountRow::new("test1", "tenant1");
        assert!(!account.is_replica());
        assert!(account.required_label_names().is_empty());
        assert!(account.gc_policies().unwrap().is_empty());
        assert!(account.platform_filter().unwrap().is_empty());

        account.upstream_peer_hostname = "keppel.example.org".into();
        account.required_labels = "maintainer, source-repo".into();
        assert!(account.is_replica());
        assert_eq!(
            account.required_label_names(),
            vec!["maintainer", "source-repo"]
        );
    }

    #[test]
    fn test_manifest_helpers() {
        let manifest = ManifestRow {
            repo_id: 1,
            digest: "sha256:abc".into(),
            media_type: "application/vnd.oci.image.manifest.v1+json".into(),
            size_bytes: 100,
            pushed_at: OffsetDateTime::UNIX_EPOCH,
            validated_at: OffsetDateTime::UNIX_EPOCH,
            validation_error_message: String::new(),
            last_pulled_at: None,
            next_vuln_check_at: None,
            vuln_status: "High".into(),
            vuln_scan_error: String::new(),
            labels_json: r#"{"stage":"prod"}"#.into(),
            gc_status_json: String::new(),
            min_layer_created_at: None,
            max_layer_created_at: None,
        };
        assert_eq!(
            manifest.vulnerability_status(),
            VulnerabilityStatus::High
        );
        assert_eq!(manifest.labels().get("stage").map(String::as_str), Some("prod"));
        assert!(!manifest.is_poisoned());
    }
}
