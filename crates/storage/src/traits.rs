//! Storage driver trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use keppel_core::AccountScope;
use std::pin::Pin;

/// A boxed stream of bytes for streaming blob reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A blob found when listing an account's storage contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlobInfo {
    pub storage_id: String,
}

/// A manifest found when listing an account's storage contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredManifestInfo {
    pub repo_name: String,
    pub digest: String,
}

/// Per-account object storage for blob and manifest contents.
///
/// Blobs are addressed by an opaque *storage ID* chosen by the caller
/// before the content digest is known, so that chunked uploads can start
/// writing immediately. Manifests are addressed by repository name and
/// digest.
///
/// Implementations must be safe for concurrent calls on distinct storage
/// IDs within the same account; concurrent calls on the same ID are the
/// caller's problem (uploads are single-writer per upload UUID).
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Append one chunk to the blob under construction. `chunk_number`
    /// starts at 1; the first chunk creates (or truncates) the temporary
    /// object.
    async fn append_to_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> StorageResult<()>;

    /// Promote the temporary object into its final location.
    async fn finalize_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
        chunk_count: u32,
    ) -> StorageResult<()>;

    /// Discard the temporary object of an aborted upload.
    async fn abort_blob_upload(
        &self,
        account: &AccountScope,
        storage_id: &str,
        chunk_count: u32,
    ) -> StorageResult<()>;

    /// Read a finalized blob. Returns the content stream and its size.
    async fn read_blob(
        &self,
        account: &AccountScope,
        storage_id: &str,
    ) -> StorageResult<(ByteStream, u64)>;

    /// A pre-authorized URL for direct download, if the backend supports
    /// them. Backends that don't return [`StorageError::CannotGenerateUrl`]
    /// and the caller proxies via `read_blob` instead.
    async fn url_for_blob(&self, account: &AccountScope, storage_id: &str)
        -> StorageResult<String>;

    /// Delete a finalized blob.
    async fn delete_blob(&self, account: &AccountScope, storage_id: &str) -> StorageResult<()>;

    async fn read_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<Vec<u8>>;

    async fn write_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
        contents: &[u8],
    ) -> StorageResult<()>;

    async fn delete_manifest(
        &self,
        account: &AccountScope,
        repo_name: &str,
        digest: &str,
    ) -> StorageResult<()>;

    /// Enumerate everything stored for the account. In-flight temporary
    /// objects are not listed. Used by the storage reconciliation sweep.
    async fn list_storage_contents(
        &self,
        account: &AccountScope,
    ) -> StorageResult<(Vec<StoredBlobInfo>, Vec<StoredManifestInfo>)>;

    /// Remove the account's storage prefix. Must refuse with
    /// [`StorageError::AccountNotEmpty`] while any objects remain; account
    /// deletion only proceeds once all blobs and manifests are gone.
    async fn cleanup_account(&self, account: &AccountScope) -> StorageResult<()>;

    /// Static identifier of the backend type, for logs and metrics.
    fn backend_name(&self) -> &'static str;
}

/// Reject storage IDs and path components that could escape the account's
/// storage prefix. Storage IDs are generated UUIDs and repo names are
/// validated upstream, so a failure here indicates a caller bug.
pub(crate) fn check_path_component(component: &str) -> StorageResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(crate::error::StorageError::InvalidKey(format!(
            "unsafe path component: {component:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_path_component() {
        assert!(check_path_component("2f9a1c").is_ok());
        assert!(check_path_component("").is_err());
        assert!(check_path_component("..").is_err());
        assert!(check_path_component("a/b").is_err());
        assert!(check_path_component("a\\b").is_err());
    }
}
