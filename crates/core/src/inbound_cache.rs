//! Cache for manifests fetched from upstream registries.
//!
//! Pull-through replication consults this cache before going to the
//! upstream, so that hot upstream manifests are not re-fetched on every
//! replica pull. The cache is opaque bytes; TTL and eviction are driver
//! concerns.

use crate::error::Result;
use async_trait::async_trait;

/// A cached upstream manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedManifest {
    pub media_type: String,
    pub contents: Vec<u8>,
}

/// Byte cache for upstream-peer manifests.
#[async_trait]
pub trait InboundCacheDriver: Send + Sync {
    /// Look up a manifest by upstream host, repository, and reference.
    /// `Ok(None)` is a miss (including expired entries).
    async fn load_manifest(
        &self,
        upstream_host: &str,
        repo_name: &str,
        reference: &str,
    ) -> Result<Option<CachedManifest>>;

    async fn store_manifest(
        &self,
        upstream_host: &str,
        repo_name: &str,
        reference: &str,
        manifest: CachedManifest,
    ) -> Result<()>;
}

/// Cache driver that caches nothing.
#[derive(Debug, Default)]
pub struct NoopInboundCache;

#[async_trait]
impl InboundCacheDriver for NoopInboundCache {
    async fn load_manifest(
        &self,
        _upstream_host: &str,
        _repo_name: &str,
        _reference: &str,
    ) -> Result<Option<CachedManifest>> {
        Ok(None)
    }

    async fn store_manifest(
        &self,
        _upstream_host: &str,
        _repo_name: &str,
        _reference: &str,
        _manifest: CachedManifest,
    ) -> Result<()> {
        Ok(())
    }
}
