//! On-demand replication from upstream registries.
//!
//! A replica account serves pulls from local state when possible. On a
//! local miss the manifest (and any blobs it references) is fetched from
//! the upstream (a peer Keppel instance or an external registry) and
//! ingested through the regular processor path, so replicated content
//! obeys exactly the same invariants as pushed content.

use crate::error::{registry_error, ProcessorError, ProcessorResult};
use crate::Processor;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt, TryStreamExt};
use keppel_core::inbound_cache::{CachedManifest, InboundCacheDriver};
use keppel_core::manifest::{ParsedManifest, ACCEPTED_MANIFEST_MEDIA_TYPES};
use keppel_core::{Digest, ManifestReference, RegistryErrorCode};
use keppel_metadata::models::{AccountRow, ManifestRow, PendingBlobRow, RepoRow};
use keppel_metadata::repos::{BlobRepo, ManifestRepo};
use keppel_metadata::MetadataError;
use keppel_storage::StorageDriver as _;
use std::time::Duration;

/// A stream of blob bytes from the upstream.
pub type BlobStream = std::pin::Pin<Box<dyn Stream<Item = ProcessorResult<Bytes>> + Send>>;

/// Where a replica account pulls from.
#[derive(Clone, Debug)]
pub struct UpstreamRef {
    /// Base URL including scheme, e.g. `https://keppel.example.org`.
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl UpstreamRef {
    /// Build the upstream reference for a replica account. Peer replicas
    /// authenticate with the peering password; external replicas use the
    /// stored pull credentials.
    pub fn for_account(account: &AccountRow, peer_password: Option<&str>) -> Option<Self> {
        if !account.upstream_peer_hostname.is_empty() {
            return Some(Self {
                base_url: format!("https://{}", account.upstream_peer_hostname),
                username: format!("replication@{}", account.upstream_peer_hostname),
                password: peer_password.unwrap_or("").to_string(),
            });
        }
        if !account.external_peer_url.is_empty() {
            return Some(Self {
                base_url: account.external_peer_url.clone(),
                username: account.external_peer_username.clone(),
                password: account.external_peer_password.clone(),
            });
        }
        None
    }

    /// The hostname, for inbound-cache keys.
    pub fn host(&self) -> &str {
        self.base_url
            .strip_prefix("https://")
            .or_else(|| self.base_url.strip_prefix("http://"))
            .unwrap_or(&self.base_url)
    }
}

/// HTTP client for the upstream side of replication. Implementations talk
/// the OCI Distribution pull protocol.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Fetch a manifest, returning its media type and bytes.
    async fn fetch_manifest(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        reference: &str,
    ) -> ProcessorResult<(String, Vec<u8>)>;

    /// Whether the manifest still exists upstream (HEAD).
    async fn manifest_exists(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        reference: &str,
    ) -> ProcessorResult<bool>;

    /// Fetch a blob as a byte stream.
    async fn fetch_blob(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        digest: &str,
    ) -> ProcessorResult<BlobStream>;
}

/// `ReplicationClient` over reqwest.
pub struct HttpReplicationClient {
    http: reqwest::Client,
}

impl HttpReplicationClient {
    pub fn new(call_timeout: Duration) -> ProcessorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ProcessorError::Upstream(e.to_string()))?;
        Ok(Self { http })
    }

    fn manifest_url(upstream: &UpstreamRef, repo_path: &str, reference: &str) -> String {
        format!("{}/v2/{repo_path}/manifests/{reference}", upstream.base_url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        upstream: &UpstreamRef,
    ) -> ProcessorResult<reqwest::Response> {
        let mut request = request;
        if !upstream.username.is_empty() {
            request = request.basic_auth(&upstream.username, Some(&upstream.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProcessorError::Upstream(e.to_string()))?;
        Ok(response)
    }
}

#[async_trait]
impl ReplicationClient for HttpReplicationClient {
    async fn fetch_manifest(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        reference: &str,
    ) -> ProcessorResult<(String, Vec<u8>)> {
        let url = Self::manifest_url(upstream, repo_path, reference);
        let request = self
            .http
            .get(&url)
            .header("Accept", ACCEPTED_MANIFEST_MEDIA_TYPES.join(", "));
        let response = self.send(request, upstream).await?;
        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(registry_error(
                    RegistryErrorCode::ManifestUnknown,
                    format!("upstream has no manifest {repo_path}:{reference}"),
                ));
            }
            status => {
                return Err(ProcessorError::Upstream(format!(
                    "GET {url} returned status {status}"
                )));
            }
        }
        let media_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProcessorError::Upstream(e.to_string()))?;
        Ok((media_type, bytes.to_vec()))
    }

    async fn manifest_exists(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        reference: &str,
    ) -> ProcessorResult<bool> {
        let url = Self::manifest_url(upstream, repo_path, reference);
        let request = self
            .http
            .head(&url)
            .header("Accept", ACCEPTED_MANIFEST_MEDIA_TYPES.join(", "));
        let response = self.send(request, upstream).await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(ProcessorError::Upstream(format!(
                "HEAD {url} returned status {status}"
            ))),
        }
    }

    async fn fetch_blob(
        &self,
        upstream: &UpstreamRef,
        repo_path: &str,
        digest: &str,
    ) -> ProcessorResult<BlobStream> {
        let url = format!("{}/v2/{repo_path}/blobs/{digest}", upstream.base_url);
        let response = self.send(self.http.get(&url), upstream).await?;
        match response.status().as_u16() {
            200 => {}
            404 => {
                return Err(registry_error(
                    RegistryErrorCode::BlobUnknown,
                    format!("upstream has no blob {digest}"),
                ));
            }
            status => {
                return Err(ProcessorError::Upstream(format!(
                    "GET {url} returned status {status}"
                )));
            }
        }
        let stream = response
            .bytes_stream()
            .map_err(|e| ProcessorError::Upstream(e.to_string()))
            .boxed();
        Ok(stream)
    }
}

impl Processor {
    /// Replicate a manifest (and, recursively, everything it references)
    /// from the account's upstream, then ingest it locally. Tag references
    /// also update the local tag.
    pub async fn replicate_manifest(
        &self,
        client: &dyn ReplicationClient,
        cache: &dyn InboundCacheDriver,
        upstream: &UpstreamRef,
        account: &AccountRow,
        repo: &RepoRow,
        reference: &ManifestReference,
    ) -> ProcessorResult<ManifestRow> {
        crate::metrics::observe("replicate_manifest", async {
            let manifest = self
                .replicate_manifest_inner(
                    client,
                    cache,
                    upstream,
                    account,
                    repo,
                    &reference.to_string(),
                )
                .await?;
            if let ManifestReference::Tag(name) = reference {
                let digest = Digest::parse(&manifest.digest)
                    .map_err(|e| ProcessorError::Upstream(e.to_string()))?;
                self.set_tag(repo, name, &digest).await?;
            }
            Ok(manifest)
        })
        .await
    }

    fn replicate_manifest_inner<'a>(
        &'a self,
        client: &'a dyn ReplicationClient,
        cache: &'a dyn InboundCacheDriver,
        upstream: &'a UpstreamRef,
        account: &'a AccountRow,
        repo: &'a RepoRow,
        reference: &'a str,
    ) -> BoxFuture<'a, ProcessorResult<ManifestRow>> {
        Box::pin(async move {
            let cached = cache
                .load_manifest(upstream.host(), &repo.name, reference)
                .await
                .unwrap_or(None);
            let (media_type, content) = match cached {
                Some(hit) => (hit.media_type, hit.contents),
                None => {
                    let fetched = client
                        .fetch_manifest(upstream, &repo.full_name(), reference)
                        .await?;
                    if let Err(err) = cache
                        .store_manifest(
                            upstream.host(),
                            &repo.name,
                            reference,
                            CachedManifest {
                                media_type: fetched.0.clone(),
                                contents: fetched.1.clone(),
                            },
                        )
                        .await
                    {
                        tracing::debug!("inbound cache store failed: {err}");
                    }
                    fetched
                }
            };

            let parsed = ParsedManifest::parse(&media_type, &content)?;
            let platform_filter = account.platform_filter()?;

            // Bottom-up: children and blobs first, so that ingest finds
            // everything it requires already present.
            for descriptor in parsed.child_manifests() {
                if !platform_filter.includes(descriptor) {
                    continue;
                }
                let child_digest = descriptor.digest.to_string();
                if self.db().get_manifest(repo.id, &child_digest).await?.is_none() {
                    self.replicate_manifest_inner(
                        client, cache, upstream, account, repo, &child_digest,
                    )
                    .await?;
                }
            }
            for descriptor in parsed.blob_references() {
                let digest = descriptor.digest.to_string();
                if self.db().get_blob(&account.name, &digest).await?.is_none() {
                    self.replicate_blob(client, upstream, account, repo, &descriptor.digest)
                        .await?;
                }
            }

            self.ingest_manifest(account, repo, &media_type, &content).await
        })
    }

    /// Stream one blob from the upstream into local storage, verifying
    /// its digest on the way, then register and mount it. Concurrent
    /// replication of the same blob is serialized through the
    /// `pending_blobs` marker: the loser waits for the winner.
    pub async fn replicate_blob(
        &self,
        client: &dyn ReplicationClient,
        upstream: &UpstreamRef,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<()> {
        crate::metrics::observe("replicate_blob", async {
            let pending = PendingBlobRow {
                account_name: account.name.clone(),
                digest: digest.to_string(),
                reason: "replication".to_string(),
                since: self.now(),
            };
            match self.db().create_pending_blob(&pending).await {
                Ok(()) => {}
                Err(MetadataError::AlreadyExists(_)) => {
                    return self.wait_for_pending_blob(account, repo, digest).await;
                }
                Err(err) => return Err(err.into()),
            }

            let result = self
                .replicate_blob_content(client, upstream, account, repo, digest)
                .await;
            if let Err(err) = self
                .db()
                .delete_pending_blob(&account.name, &digest.to_string())
                .await
            {
                tracing::error!(digest = %digest, "could not clear pending blob: {err}");
            }
            result
        })
        .await
    }

    async fn replicate_blob_content(
        &self,
        client: &dyn ReplicationClient,
        upstream: &UpstreamRef,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<()> {
        let storage_id = uuid::Uuid::new_v4().simple().to_string();
        let scope = account.scope();
        let mut stream = client
            .fetch_blob(upstream, &repo.full_name(), &digest.to_string())
            .await?;

        let mut hasher = Digest::hasher();
        let mut chunk_number: u32 = 0;
        let mut size_bytes: i64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.abort_replication_upload(&scope, &storage_id, chunk_number).await;
                    return Err(err);
                }
            };
            chunk_number += 1;
            size_bytes += chunk.len() as i64;
            hasher.update(&chunk);
            if let Err(err) = self
                .storage()
                .append_to_blob(&scope, &storage_id, chunk_number, chunk)
                .await
            {
                self.abort_replication_upload(&scope, &storage_id, chunk_number).await;
                return Err(err.into());
            }
        }
        let actual = hasher.finalize();
        if actual != *digest {
            self.abort_replication_upload(&scope, &storage_id, chunk_number).await;
            return Err(registry_error(
                RegistryErrorCode::DigestInvalid,
                format!("upstream blob {digest} hashed to {actual}"),
            ));
        }

        self.storage()
            .finalize_blob(&scope, &storage_id, chunk_number)
            .await?;
        let blob = self
            .register_blob(account, digest, size_bytes, &storage_id, "")
            .await?;
        if blob.storage_id != storage_id {
            // someone else registered the blob first
            self.storage().delete_blob(&scope, &storage_id).await?;
        }
        self.db().mount_blob(blob.id, repo.id).await?;
        Ok(())
    }

    async fn abort_replication_upload(
        &self,
        scope: &keppel_core::AccountScope,
        storage_id: &str,
        chunk_count: u32,
    ) {
        if chunk_count == 0 {
            return;
        }
        if let Err(err) = self
            .storage()
            .abort_blob_upload(scope, storage_id, chunk_count)
            .await
        {
            tracing::debug!("could not abort replication upload: {err}");
        }
    }

    async fn wait_for_pending_blob(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        digest: &Digest,
    ) -> ProcessorResult<()> {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(blob) = self.db().get_blob(&account.name, &digest.to_string()).await? {
                self.db().mount_blob(blob.id, repo.id).await?;
                return Ok(());
            }
            if self
                .db()
                .get_pending_blob(&account.name, &digest.to_string())
                .await?
                .is_none()
            {
                break;
            }
        }
        Err(ProcessorError::Upstream(format!(
            "timed out waiting for concurrent replication of blob {digest}"
        )))
    }
}
