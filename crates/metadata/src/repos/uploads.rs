//! Chunked-upload repository.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for in-flight chunked blob uploads.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()>;

    async fn get_upload(&self, repo_id: i64, uuid: Uuid) -> MetadataResult<Option<UploadRow>>;

    /// Record progress: accumulated size, declared digest, chunk count.
    async fn update_upload(&self, upload: &UploadRow) -> MetadataResult<()>;

    async fn delete_upload(&self, repo_id: i64, uuid: Uuid) -> MetadataResult<bool>;
}
