//! In-memory storage backend for tests and ephemeral deployments.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    check_path_component, ByteStream, StorageDriver, StoredBlobInfo, StoredManifestInfo,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keppel_core::AccountScope;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct AccountObjects {
    /// storage_id -> contents
    blobs: HashMap<String, Vec<u8>>,
    /// storage_id -> partially written contents
    temp_blobs: HashMap<String, Vec<u8>>,
    /// (repo_name, digest) -> contents
    manifests: HashMap<(String, String), Vec<u8>>,
}

/// Storage driver that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryDriver {
    // keyed by (auth_tenant_id, account_name)
    accounts: Mutex<HashMap<(String, String), AccountObjects>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(account: &AccountScope) -> (String, String) {
        (account.auth_tenant_id.clone(), account.name.clone())
    }

    fn with_account<T>(
        &self,
        account: &AccountScope,
        f: impl FnOnce(&mut AccountObjects) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut accounts = self.accounts.lock().unwrap();
        f(accounts.entry(Self::key(account)).or_default())
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn append_to_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> StorageResult<()> {
        check_path_component(storage_id)?;
        self.with_account(account, |objects| {
            if chunk_number == 1 {
                objects.temp_blobs.insert(storage_id.to_string(), chunk.to_vec());
            } else {
                let buffer = objects
                    .temp_blobs
                    .get_mut(storage_id)
                    .ok_or_else(|| StorageError::NotFound(storage_id.to_string()))?;
                buffer.extend_from_slice(&chunk);
            }
            Ok(())
        })
    }

    async fn finalize_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        _chunk_count: u32,
    ) -> StorageResult<()> {
        self.with_account(account, |objects| {
            let contents = objects
                .temp_blobs
                .remove(storage_id)
                .ok_or_else(|| StorageError::NotFound(storage_id.to_string()))?;
            objects.blobs.insert(storage_id.to_string(), contents);
            Ok(())
        })
    }

    async fn abort_blob_upload(
        &self,
        account: &AccountScope,
        storage_id: &str,
        _chunk_count: u32,
    ) -> StorageResult<()> {
        self.with_account(account, |objects| {
            objects
                .temp_blobs
                .remove(storage_id)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(storage_id.to_string()))
        })
    }

    async fn read_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
    ) -> StorageResult<(ByteStream, u64)> {
        let contents = self.with_account(account, |objects| {
            objects
                .blobs
                .get(storage_id)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(storage_id.to_string()))
        })?;
        let size = contents.len() as u64;
        let stream = futures::stream::once(async move { Ok(Bytes::from(contents)) }).boxed();
        Ok((stream, size))
    }

    async fn url_for_blob(
        &self,
        _account: &AccountScope,
        _storage_id: &str,
    ) -> StorageResult<String> {
        Err(StorageError::CannotGenerateUrl)
    }

    async fn delete_blob(&self, account: &AccountScope, storage_id: &str) -> StorageResult<()> {
        self.with_account(account, |objects| {
            objects
                .blobs
                .remove(storage_id)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(storage_id.to_string()))
        })
    }

    async fn read_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<Vec<u8>> {
        self.with_account(account, |objects| {
            objects
                .manifests
                .get(&(repo_name.to_string(), digest.to_string()))
                .cloned()
                .ok_or_else(|| StorageError::NotFound(format!("{repo_name}@{digest}")))
        })
    }

    async fn write_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> StorageResult<()> {
        self.with_account(account, |objects| {
            objects
                .manifests
                .insert((repo_name.to_string(), digest.to_string()), contents.to_vec());
            Ok(())
        })
    }

    async fn delete_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<()> {
        self.with_account(account, |objects| {
            objects
                .manifests
                .remove(&(repo_name.to_string(), digest.to_string()))
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(format!("{repo_name}@{digest}")))
        })
    }

    async fn list_storage_contents(
        &self,
        account: &AccountScope,
    ) -> StorageResult<(Vec<StoredBlobInfo>, Vec<StoredManifestInfo>)> {
        self.with_account(account, |objects| {
            let blobs = objects
                .blobs
                .keys()
                .map(|storage_id| StoredBlobInfo {
                    storage_id: storage_id.clone(),
                })
                .collect();
            let manifests = objects
                .manifests
                .keys()
                .map(|(repo_name, digest)| StoredManifestInfo {
                    repo_name: repo_name.clone(),
                    digest: digest.clone(),
                })
                .collect();
            Ok((blobs, manifests))
        })
    }

    async fn cleanup_account(&self, account: &AccountScope) -> StorageResult<()> {
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(objects) = accounts.get(&Self::key(account)) {
            if let Some(storage_id) = objects.blobs.keys().next() {
                return Err(StorageError::AccountNotEmpty {
                    kind: "blob",
                    id: storage_id.clone(),
                });
            }
            if let Some((repo_name, digest)) = objects.manifests.keys().next() {
                return Err(StorageError::AccountNotEmpty {
                    kind: "manifest",
                    id: format!("{repo_name}@{digest}"),
                });
            }
        }
        accounts.remove(&Self::key(account));
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
