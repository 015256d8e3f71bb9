//! The chunked blob upload state machine.
//!
//! An upload is single-writer, keyed by its UUID. Chunks append to a
//! temporary storage object; finalize renames it into place, verifies the
//! declared digest against the stored bytes, and registers + mounts the
//! blob. The loser of a concurrent identical push discards its own
//! storage object.

use crate::error::{registry_error, ProcessorResult};
use crate::Processor;
use bytes::Bytes;
use futures::TryStreamExt;
use keppel_core::{Digest, RegistryErrorCode};
use keppel_metadata::models::{AccountRow, BlobRow, RepoRow, UploadRow};
use keppel_metadata::repos::{BlobRepo, UploadRepo};
use keppel_storage::StorageDriver as _;
use uuid::Uuid;

impl Processor {
    /// Start a new chunked upload in the repo.
    pub async fn begin_upload(&self, repo: &RepoRow) -> ProcessorResult<UploadRow> {
        crate::metrics::observe("begin_upload", async {
            let upload = UploadRow {
                repo_id: repo.id,
                uuid: Uuid::new_v4(),
                storage_id: Uuid::new_v4().simple().to_string(),
                size_bytes: 0,
                digest: String::new(),
                num_chunks: 0,
                updated_at: self.now(),
            };
            self.db().create_upload(&upload).await?;
            Ok(upload)
        })
        .await
    }

    /// Append one chunk to the upload.
    pub async fn append_chunk(
        &self,
        account: &AccountRow,
        upload: &UploadRow,
        chunk: Bytes,
    ) -> ProcessorResult<UploadRow> {
        crate::metrics::observe("append_chunk", async {
            let mut upload = self.refetch_upload(upload).await?;
            let chunk_number = upload.num_chunks as u32 + 1;
            self.storage()
                .append_to_blob(&account.scope(), &upload.storage_id, chunk_number, chunk.clone())
                .await?;
            upload.size_bytes += chunk.len() as i64;
            upload.num_chunks = chunk_number as i32;
            upload.updated_at = self.now();
            self.db().update_upload(&upload).await?;
            Ok(upload)
        })
        .await
    }

    /// Finish the upload: finalize the storage object, verify the declared
    /// digest against the stored bytes, and register + mount the blob.
    pub async fn finalize_upload(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        upload: &UploadRow,
        declared_digest: &Digest,
        media_type: &str,
    ) -> ProcessorResult<BlobRow> {
        crate::metrics::observe("finalize_upload", async {
            let upload = self.refetch_upload(upload).await?;
            let scope = account.scope();
            self.storage()
                .finalize_blob(&scope, &upload.storage_id, upload.num_chunks as u32)
                .await?;

            // Verify content: stream the finalized object back through the
            // digest. A mismatch invalidates the whole upload.
            let (stream, size) = self.storage().read_blob(&scope, &upload.storage_id).await?;
            let mut hasher = Digest::hasher();
            stream
                .try_for_each(|chunk| {
                    hasher.update(&chunk);
                    futures::future::ready(Ok(()))
                })
                .await?;
            let actual = hasher.finalize();
            if actual != *declared_digest {
                self.storage().delete_blob(&scope, &upload.storage_id).await?;
                self.db().delete_upload(repo.id, upload.uuid).await?;
                return Err(registry_error(
                    RegistryErrorCode::DigestInvalid,
                    format!("expected digest {declared_digest}, got {actual}"),
                ));
            }

            let blob = self
                .register_blob(account, declared_digest, size as i64, &upload.storage_id, media_type)
                .await?;
            if blob.storage_id != upload.storage_id {
                // Lost the race against a concurrent identical push; the
                // winner's storage object stays, ours goes.
                self.storage().delete_blob(&scope, &upload.storage_id).await?;
            }
            self.db().mount_blob(blob.id, repo.id).await?;
            self.db().delete_upload(repo.id, upload.uuid).await?;
            Ok(blob)
        })
        .await
    }

    /// Abort the upload, discarding the temporary object.
    pub async fn abort_upload(
        &self,
        account: &AccountRow,
        upload: &UploadRow,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("abort_upload", async {
            if upload.num_chunks > 0 {
                // Tolerate a missing temp object; the storage sweep would
                // have cleaned it up anyway.
                if let Err(err) = self
                    .storage()
                    .abort_blob_upload(
                        &account.scope(),
                        &upload.storage_id,
                        upload.num_chunks as u32,
                    )
                    .await
                {
                    tracing::debug!(upload = %upload.uuid, "abort found no temp object: {err}");
                }
            }
            self.db().delete_upload(upload.repo_id, upload.uuid).await?;
            Ok(())
        })
        .await
    }

    async fn refetch_upload(&self, upload: &UploadRow) -> ProcessorResult<UploadRow> {
        self.db()
            .get_upload(upload.repo_id, upload.uuid)
            .await?
            .ok_or_else(|| {
                registry_error(
                    RegistryErrorCode::BlobUploadUnknown,
                    format!("upload {} does not exist", upload.uuid),
                )
            })
    }
}
