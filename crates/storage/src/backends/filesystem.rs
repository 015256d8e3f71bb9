//! Local filesystem storage backend.
//!
//! Layout: `{auth_tenant_id}/{account}/b/{storage_id}` for blobs and
//! `{auth_tenant_id}/{account}/m/{repo_name}/{digest}` for manifests.
//! Objects being written carry a `.tmp` suffix until finalized, so that
//! listings never observe partial content.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    check_path_component, ByteStream, StorageDriver, StoredBlobInfo, StoredManifestInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keppel_core::AccountScope;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Local filesystem storage driver.
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    /// Create a new filesystem driver rooted at the given directory.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn account_path(&self, account: &AccountScope) -> PathBuf {
        self.root.join(&account.auth_tenant_id).join(&account.name)
    }

    fn blob_path(&self, account: &AccountScope, storage_id: &str) -> StorageResult<PathBuf> {
        check_path_component(storage_id)?;
        Ok(self.account_path(account).join("b").join(storage_id))
    }

    fn manifest_path(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<PathBuf> {
        for component in repo_name.split('/') {
            check_path_component(component)?;
        }
        check_path_component(digest)?;
        Ok(self
            .account_path(account)
            .join("m")
            .join(repo_name)
            .join(digest))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

fn map_not_found(err: std::io::Error, what: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(what.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    #[instrument(skip(self, chunk), fields(backend = "filesystem"))]
    async fn append_to_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> StorageResult<()> {
        let path = tmp_path(&self.blob_path(account, storage_id)?);
        let mut file = if chunk_number == 1 {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::File::create(&path).await?
        } else {
            fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await
                .map_err(|e| map_not_found(e, storage_id))?
        };
        file.write_all(&chunk).await?;
        file.flush().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn finalize_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        _chunk_count: u32,
    ) -> StorageResult<()> {
        let path = self.blob_path(account, storage_id)?;
        fs::rename(tmp_path(&path), &path)
            .await
            .map_err(|e| map_not_found(e, storage_id))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_blob_upload(
        &self,
        account: &AccountScope,
        storage_id: &str,
        _chunk_count: u32,
    ) -> StorageResult<()> {
        let path = tmp_path(&self.blob_path(account, storage_id)?);
        fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(e, storage_id))
    }

    async fn read_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
    ) -> StorageResult<(ByteStream, u64)> {
        let path = self.blob_path(account, storage_id)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(e, storage_id))?;
        let size = file.metadata().await?.len();
        let stream = tokio_util::io::ReaderStream::new(file)
            .map(|item| item.map_err(StorageError::Io))
            .boxed();
        Ok((stream, size))
    }

    async fn url_for_blob(
        &self,
        _account: &AccountScope,
        _storage_id: &str,
    ) -> StorageResult<String> {
        Err(StorageError::CannotGenerateUrl)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_blob(&self, account: &AccountScope, storage_id: &str) -> StorageResult<()> {
        let path = self.blob_path(account, storage_id)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(e, storage_id))
    }

    async fn read_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<Vec<u8>> {
        let path = self.manifest_path(account, repo_name, digest)?;
        fs::read(&path)
            .await
            .map_err(|e| map_not_found(e, &format!("{repo_name}@{digest}")))
    }

    async fn write_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> StorageResult<()> {
        let path = self.manifest_path(account, repo_name, digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(&path);
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<()> {
        let path = self.manifest_path(account, repo_name, digest)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(e, &format!("{repo_name}@{digest}")))
    }

    async fn list_storage_contents(
        &self,
        account: &AccountScope,
    ) -> StorageResult<(Vec<StoredBlobInfo>, Vec<StoredManifestInfo>)> {
        let mut blobs = Vec::new();
        let blob_dir = self.account_path(account).join("b");
        match fs::read_dir(&blob_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.ends_with(".tmp") {
                        blobs.push(StoredBlobInfo { storage_id: name });
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut manifests = Vec::new();
        let manifest_root = self.account_path(account).join("m");
        collect_manifests(&manifest_root, String::new(), &mut manifests).await?;
        Ok((blobs, manifests))
    }

    async fn cleanup_account(&self, account: &AccountScope) -> StorageResult<()> {
        let (blobs, manifests) = self.list_storage_contents(account).await?;
        if let Some(blob) = blobs.first() {
            return Err(StorageError::AccountNotEmpty {
                kind: "blob",
                id: blob.storage_id.clone(),
            });
        }
        if let Some(manifest) = manifests.first() {
            return Err(StorageError::AccountNotEmpty {
                kind: "manifest",
                id: format!("{}@{}", manifest.repo_name, manifest.digest),
            });
        }
        match fs::remove_dir_all(self.account_path(account)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Walk the manifest tree. Repository names may contain slashes, so
/// directories nest arbitrarily deep; leaf files are digests.
async fn collect_manifests(
    dir: &Path,
    repo_prefix: String,
    out: &mut Vec<StoredManifestInfo>,
) -> StorageResult<()> {
    let mut pending = vec![(dir.to_path_buf(), repo_prefix)];
    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(StorageError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let child_prefix = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                pending.push((entry.path(), child_prefix));
            } else if !name.ends_with(".tmp") && !prefix.is_empty() {
                out.push(StoredManifestInfo {
                    repo_name: prefix.clone(),
                    digest: name,
                });
            }
        }
    }
    Ok(())
}
