//! Manifest ingestion, deletion, tagging, and integrity checking.

use crate::error::{registry_error, ProcessorError, ProcessorResult};
use crate::Processor;
use futures::TryStreamExt;
use keppel_core::audit::{AuditAction, AuditEvent};
use keppel_core::manifest::{is_image_config_media_type, ImageConfig, ParsedManifest};
use keppel_core::reference::validate_tag_name;
use keppel_core::vuln::VulnerabilityStatus;
use keppel_core::{Digest, ManifestReference, RegistryErrorCode, MAX_MANIFEST_SIZE};
use keppel_metadata::models::{AccountRow, ManifestRow, RepoRow};
use keppel_metadata::repos::{BlobRepo, ManifestRepo, QuotaRepo};
use keppel_metadata::MetadataError;
use keppel_storage::StorageDriver as _;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Everything collected while resolving a manifest's references.
struct ResolvedManifest {
    blob_ids: Vec<i64>,
    child_digests: Vec<String>,
    labels: HashMap<String, String>,
    min_layer_created_at: Option<OffsetDateTime>,
    max_layer_created_at: Option<OffsetDateTime>,
}

impl Processor {
    /// Validate and ingest a manifest pushed (or replicated) into the repo.
    ///
    /// Verifies that every referenced blob exists in the account (mounting
    /// it into the repo if needed) and that every referenced child
    /// manifest exists in the repo, enforces the account's required labels
    /// and the tenant's manifest quota, extracts labels and layer
    /// timestamps from the image config, and commits everything
    /// atomically. The manifest bytes are written to the storage driver
    /// before the database commit; a crash in between leaves an orphan
    /// object that the storage sweep collects.
    pub async fn ingest_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        media_type: &str,
        content: &[u8],
    ) -> ProcessorResult<ManifestRow> {
        crate::metrics::observe("ingest_manifest", async {
            if content.len() > MAX_MANIFEST_SIZE {
                return Err(registry_error(
                    RegistryErrorCode::ManifestInvalid,
                    format!("manifest exceeds size limit of {MAX_MANIFEST_SIZE} bytes"),
                ));
            }
            let digest = Digest::compute(content);
            let parsed = ParsedManifest::parse(media_type, content)?;
            let resolved = self.resolve_references(account, repo, &digest, &parsed).await?;

            for required in account.required_label_names() {
                if !resolved.labels.contains_key(required) {
                    return Err(registry_error(
                        RegistryErrorCode::ManifestInvalid,
                        format!("missing required label {required:?}"),
                    ));
                }
            }

            let now = self.now();
            let manifest = ManifestRow {
                repo_id: repo.id,
                digest: digest.to_string(),
                media_type: media_type.to_string(),
                size_bytes: content.len() as i64,
                pushed_at: now,
                validated_at: now,
                validation_error_message: String::new(),
                last_pulled_at: None,
                next_vuln_check_at: None,
                vuln_status: VulnerabilityStatus::Pending.as_str().to_string(),
                vuln_scan_error: String::new(),
                labels_json: if resolved.labels.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&resolved.labels).map_err(|e| {
                        ProcessorError::Metadata(MetadataError::Internal(e.to_string()))
                    })?
                },
                gc_status_json: String::new(),
                min_layer_created_at: resolved.min_layer_created_at,
                max_layer_created_at: resolved.max_layer_created_at,
            };

            self.storage()
                .write_manifest(&account.scope(), &repo.name, &manifest.digest, content)
                .await?;

            let quota = self
                .db()
                .get_quota(&account.auth_tenant_id)
                .await?
                .map(|q| q.manifests)
                .unwrap_or(0);
            self.db()
                .create_manifest(
                    &manifest,
                    content,
                    &resolved.blob_ids,
                    &resolved.child_digests,
                    &account.auth_tenant_id,
                    quota,
                )
                .await?;

            self.auditor().record(AuditEvent {
                observed_at: now,
                user_name: String::new(),
                action: AuditAction::Create,
                account: account.name.clone(),
                repository: Some(repo.name.clone()),
                target_type: "manifest",
                target_id: manifest.digest.clone(),
            });
            Ok(manifest)
        })
        .await
    }

    /// Resolve and verify every reference of the parsed manifest.
    async fn resolve_references(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        parent_digest: &Digest,
        parsed: &ParsedManifest,
    ) -> ProcessorResult<ResolvedManifest> {
        let mut resolved = ResolvedManifest {
            blob_ids: Vec::new(),
            child_digests: Vec::new(),
            labels: HashMap::new(),
            min_layer_created_at: None,
            max_layer_created_at: None,
        };

        for descriptor in parsed.blob_references() {
            let digest = descriptor.digest.to_string();
            let blob = self
                .db()
                .get_blob(&account.name, &digest)
                .await?
                .ok_or_else(|| {
                    registry_error(
                        RegistryErrorCode::BlobUnknown,
                        format!("manifest references unknown blob {digest}"),
                    )
                })?;
            self.db().mount_blob(blob.id, repo.id).await?;
            resolved.blob_ids.push(blob.id);

            if is_image_config_media_type(&descriptor.media_type)
                && descriptor.size as usize <= MAX_MANIFEST_SIZE
            {
                let config = self.read_image_config(account, &blob.storage_id).await?;
                resolved.labels = config.labels();
                let (min, max) = config.layer_timestamps();
                resolved.min_layer_created_at = min;
                resolved.max_layer_created_at = max;
            }
        }

        let platform_filter = account.platform_filter()?;
        for descriptor in parsed.child_manifests() {
            if descriptor.digest == *parent_digest {
                return Err(registry_error(
                    RegistryErrorCode::ManifestInvalid,
                    "manifest references itself",
                ));
            }
            if account.is_replica() && !platform_filter.includes(descriptor) {
                // Children outside the platform filter are not replicated,
                // so the index keeps its bytes but not a local reference.
                continue;
            }
            let child_digest = descriptor.digest.to_string();
            let child = self
                .db()
                .get_manifest(repo.id, &child_digest)
                .await?
                .ok_or_else(|| {
                    registry_error(
                        RegistryErrorCode::ManifestUnknown,
                        format!("index references unknown manifest {child_digest}"),
                    )
                })?;
            // Aggregate layer timestamps over the children.
            for ts in [child.min_layer_created_at, child.max_layer_created_at]
                .into_iter()
                .flatten()
            {
                resolved.min_layer_created_at = Some(match resolved.min_layer_created_at {
                    Some(m) if m < ts => m,
                    _ => ts,
                });
                resolved.max_layer_created_at = Some(match resolved.max_layer_created_at {
                    Some(m) if m > ts => m,
                    _ => ts,
                });
            }
            resolved.child_digests.push(child_digest);
        }

        Ok(resolved)
    }

    async fn read_image_config(
        &self,
        account: &AccountRow,
        storage_id: &str,
    ) -> ProcessorResult<ImageConfig> {
        let (stream, _) = self.storage().read_blob(&account.scope(), storage_id).await?;
        let bytes: Vec<u8> = stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(ImageConfig::parse(&bytes)?)
    }

    /// Delete a manifest and its stored bytes. Tags and references cascade
    /// away; blob mounts are left for the blob-mount sweeper so that the
    /// mark-and-sweep grace period applies.
    pub async fn delete_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("delete_manifest", async {
            let deleted = self.db().delete_manifest(repo.id, &digest.to_string()).await?;
            if !deleted {
                return Err(registry_error(
                    RegistryErrorCode::ManifestUnknown,
                    format!("manifest {digest} does not exist in repo {}", repo.full_name()),
                ));
            }
            if let Err(err) = self
                .storage()
                .delete_manifest(&account.scope(), &repo.name, &digest.to_string())
                .await
            {
                // The row is gone; a stale storage object is collected by
                // the storage sweep.
                tracing::warn!(
                    repo = %repo.full_name(), digest = %digest,
                    "could not delete manifest from storage: {err}"
                );
            }
            self.auditor().record(AuditEvent {
                observed_at: self.now(),
                user_name: String::new(),
                action: AuditAction::Delete,
                account: account.name.clone(),
                repository: Some(repo.name.clone()),
                target_type: "manifest",
                target_id: digest.to_string(),
            });
            Ok(())
        })
        .await
    }

    /// Create or move a tag.
    pub async fn set_tag(
        &self,
        repo: &RepoRow,
        name: &str,
        digest: &Digest,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("set_tag", async {
            validate_tag_name(name)?;
            self.db()
                .upsert_tag(repo.id, name, &digest.to_string(), self.now())
                .await
                .map_err(|err| match err {
                    MetadataError::NotFound(_) => registry_error(
                        RegistryErrorCode::ManifestUnknown,
                        format!("cannot tag unknown manifest {digest}"),
                    ),
                    other => other.into(),
                })
        })
        .await
    }

    /// Delete a tag. The manifest stays; pulls by digest keep working.
    pub async fn delete_tag(&self, repo: &RepoRow, name: &str) -> ProcessorResult<()> {
        crate::metrics::observe("delete_tag", async {
            let deleted = self.db().delete_tag(repo.id, name).await?;
            if !deleted {
                return Err(registry_error(
                    RegistryErrorCode::ManifestUnknown,
                    format!("tag {name} does not exist in repo {}", repo.full_name()),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Record a pull for `last_pulled_at` bookkeeping. Best-effort: not
    /// transactional with the bytes actually served.
    pub async fn record_pull(
        &self,
        repo: &RepoRow,
        reference: &ManifestReference,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("record_pull", async {
            let now = self.now();
            match reference {
                ManifestReference::Digest(digest) => {
                    self.db()
                        .update_manifest_pulled_at(repo.id, &digest.to_string(), now)
                        .await?;
                }
                ManifestReference::Tag(name) => {
                    if let Some(tag) = self.db().get_tag(repo.id, name).await? {
                        self.db().update_tag_pulled_at(repo.id, name, now).await?;
                        self.db()
                            .update_manifest_pulled_at(repo.id, &tag.digest, now)
                            .await?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Re-check an existing manifest's references against the current
    /// database state. Used by the janitor's re-validation sweep.
    pub async fn check_manifest_integrity(
        &self,
        repo: &RepoRow,
        manifest: &ManifestRow,
    ) -> ProcessorResult<()> {
        let content = self
            .db()
            .get_manifest_content(repo.id, &manifest.digest)
            .await?
            .ok_or_else(|| {
                registry_error(
                    RegistryErrorCode::ManifestUnknown,
                    format!("stored content for manifest {} is missing", manifest.digest),
                )
            })?;
        let parsed = ParsedManifest::parse(&manifest.media_type, &content)?;

        for descriptor in parsed.blob_references() {
            let digest = descriptor.digest.to_string();
            let blob = self
                .db()
                .get_blob(&repo.account_name, &digest)
                .await?
                .ok_or_else(|| {
                    registry_error(
                        RegistryErrorCode::BlobUnknown,
                        format!("manifest references unknown blob {digest}"),
                    )
                })?;
            if self.db().get_blob_mount(blob.id, repo.id).await?.is_none() {
                return Err(registry_error(
                    RegistryErrorCode::BlobUnknown,
                    format!("blob {digest} is not mounted in this repo"),
                ));
            }
        }
        for child in self.db().child_refs(repo.id, &manifest.digest).await? {
            if self
                .db()
                .get_manifest(repo.id, &child.child_digest)
                .await?
                .is_none()
            {
                return Err(registry_error(
                    RegistryErrorCode::ManifestUnknown,
                    format!("index references unknown manifest {}", child.child_digest),
                ));
            }
        }
        Ok(())
    }
}
