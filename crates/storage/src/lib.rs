//! Object storage abstraction and backends for Keppel.
//!
//! The core never sees object layout: it addresses blobs by an opaque
//! per-account storage ID and manifests by `(repo_name, digest)`. This
//! crate provides:
//! - The [`StorageDriver`] capability trait
//! - A local filesystem backend
//! - An in-memory backend for tests

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemDriver;
pub use backends::memory::MemoryDriver;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, StorageDriver, StoredBlobInfo, StoredManifestInfo};

use keppel_core::config::StorageConfig;
use std::sync::Arc;

/// Create a storage driver from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageDriver>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let driver = FilesystemDriver::new(path).await?;
            Ok(Arc::new(driver))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryDriver::new())),
    }
}
