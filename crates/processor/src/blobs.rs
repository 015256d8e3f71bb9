//! Blob registration and cross-repo mounting.

use crate::error::{registry_error, ProcessorResult};
use crate::Processor;
use keppel_core::audit::{AuditAction, AuditEvent};
use keppel_core::{Digest, RegistryErrorCode};
use keppel_metadata::models::{AccountRow, BlobRow, RepoRow};
use keppel_metadata::repos::blobs::NewBlob;
use keppel_metadata::repos::BlobRepo;

impl Processor {
    /// Register a blob in the account. Idempotent on `(account, digest)`:
    /// re-registering returns the existing row and the caller discards its
    /// redundant storage object.
    pub async fn register_blob(
        &self,
        account: &AccountRow,
        digest: &Digest,
        size_bytes: i64,
        storage_id: &str,
        media_type: &str,
    ) -> ProcessorResult<BlobRow> {
        crate::metrics::observe("register_blob", async {
            let blob = self
                .db()
                .upsert_blob(&NewBlob {
                    account_name: account.name.clone(),
                    digest: digest.to_string(),
                    size_bytes,
                    storage_id: storage_id.to_string(),
                    media_type: media_type.to_string(),
                    pushed_at: self.now(),
                })
                .await?;
            self.auditor().record(AuditEvent {
                observed_at: self.now(),
                user_name: String::new(),
                action: AuditAction::Create,
                account: account.name.clone(),
                repository: None,
                target_type: "blob",
                target_id: blob.digest.clone(),
            });
            Ok(blob)
        })
        .await
    }

    /// Mount a blob of the repo's account into the repo (cross-repo blob
    /// mount). A blob belonging to a different account reads as unknown.
    pub async fn mount_blob_into_repo(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<BlobRow> {
        crate::metrics::observe("mount_blob_into_repo", async {
            let blob = self
                .db()
                .get_blob(&account.name, &digest.to_string())
                .await?
                .ok_or_else(|| {
                    registry_error(
                        RegistryErrorCode::BlobUnknown,
                        format!("blob {digest} does not exist in account {}", account.name),
                    )
                })?;
            self.db().mount_blob(blob.id, repo.id).await?;
            Ok(blob)
        })
        .await
    }

    /// Whether the blob is visible in the repo (digest pull path).
    pub async fn find_blob_in_repo(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<Option<BlobRow>> {
        let Some(blob) = self
            .db()
            .get_blob(&account.name, &digest.to_string())
            .await?
        else {
            return Ok(None);
        };
        let mount = self.db().get_blob_mount(blob.id, repo.id).await?;
        Ok(mount.map(|_| blob))
    }
}
