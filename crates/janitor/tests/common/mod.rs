//! Common test utilities for janitor tests.

use bytes::Bytes;
use keppel_core::manifest::media_types;
use keppel_core::{Digest, FederationDriver, NullAuditor, TrivialFederationDriver};
use keppel_janitor::{Janitor, TrivialScanner, VulnerabilityScanner};
use keppel_metadata::models::{AccountRow, BlobRow, ManifestRow, QuotaRow, RepoRow};
use keppel_metadata::repos::blobs::NewBlob;
use keppel_metadata::repos::{AccountRepo, BlobRepo, QuotaRepo, RepoRepo};
use keppel_metadata::SqliteStore;
use keppel_processor::{Clock, Processor};
use keppel_storage::{MemoryDriver, StorageDriver as _};
use std::sync::{Arc, Mutex};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// An adjustable time source shared between the test, the janitor, and
/// the processor.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<OffsetDateTime>>);

impl TestClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    pub fn as_clock(&self) -> Clock {
        let clock = self.clone();
        Arc::new(move || clock.now())
    }
}

pub struct TestEnv {
    pub db: Arc<SqliteStore>,
    pub storage: Arc<MemoryDriver>,
    pub janitor: Janitor,
    pub processor: Processor,
    pub clock: TestClock,
    _temp_dir: tempfile::TempDir,
}

pub fn start_time() -> OffsetDateTime {
    datetime!(2024-06-01 12:00 UTC)
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_drivers(Arc::new(TrivialFederationDriver), Arc::new(TrivialScanner)).await
    }

    pub async fn with_drivers(
        federation: Arc<dyn FederationDriver>,
        scanner: Arc<dyn VulnerabilityScanner>,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
        let db = Arc::new(
            SqliteStore::new(temp_dir.path().join("test.db"))
                .await
                .expect("failed to create metadata store"),
        );
        let storage = Arc::new(MemoryDriver::new());
        let clock = TestClock::new(start_time());
        let janitor = Janitor::new(
            db.clone(),
            storage.clone(),
            federation,
            scanner,
            Arc::new(NullAuditor),
        )
        .with_clock(clock.as_clock());
        let processor = Processor::new(db.clone(), storage.clone(), Arc::new(NullAuditor))
            .with_clock(clock.as_clock());
        Self {
            db,
            storage,
            janitor,
            processor,
            clock,
            _temp_dir: temp_dir,
        }
    }

    pub async fn create_account(&self, name: &str) -> AccountRow {
        let account = AccountRow::new(name, "tenant1");
        self.db.create_account(&account).await.unwrap();
        self.db
            .set_quota(&QuotaRow {
                auth_tenant_id: "tenant1".into(),
                manifests: 100,
            })
            .await
            .unwrap();
        account
    }

    pub async fn create_repo(&self, account: &AccountRow, name: &str) -> RepoRow {
        self.db.get_or_create_repo(&account.name, name).await.unwrap()
    }

    /// Push a blob into storage + database and mount it into the repo.
    pub async fn push_blob_into_repo(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        content: &[u8],
    ) -> BlobRow {
        let digest = Digest::compute(content);
        let storage_id = uuid::Uuid::new_v4().simple().to_string();
        let scope = account.scope();
        self.storage
            .append_to_blob(&scope, &storage_id, 1, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        self.storage.finalize_blob(&scope, &storage_id, 1).await.unwrap();
        let blob = self
            .db
            .upsert_blob(&NewBlob {
                account_name: account.name.clone(),
                digest: digest.to_string(),
                size_bytes: content.len() as i64,
                storage_id,
                media_type: String::new(),
                pushed_at: self.clock.now(),
            })
            .await
            .unwrap();
        self.db.mount_blob(blob.id, repo.id).await.unwrap();
        blob
    }

    /// Push a one-layer image manifest through the processor so all refs
    /// and contents are in place. Returns the manifest row.
    pub async fn push_image_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        layer: &[u8],
    ) -> ManifestRow {
        let config = serde_json::to_vec(&serde_json::json!({
            "created": "2024-03-01T10:00:00Z",
            "config": {"Labels": {}},
            "history": [],
        }))
        .unwrap();
        self.push_blob_into_repo(account, repo, &config).await;
        self.push_blob_into_repo(account, repo, layer).await;
        let manifest_bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST,
            "config": {
                "mediaType": media_types::DOCKER_IMAGE_CONFIG,
                "digest": Digest::compute(&config).to_string(),
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": Digest::compute(layer).to_string(),
                "size": layer.len(),
            }],
        }))
        .unwrap();
        self.processor
            .ingest_manifest(account, repo, media_types::DOCKER_MANIFEST, &manifest_bytes)
            .await
            .unwrap()
    }

    /// Push an index referencing the given (already pushed) manifests.
    pub async fn push_index_manifest(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        children: &[&ManifestRow],
    ) -> ManifestRow {
        let entries: Vec<serde_json::Value> = children
            .iter()
            .map(|child| {
                serde_json::json!({
                    "mediaType": child.media_type,
                    "digest": child.digest,
                    "size": child.size_bytes,
                })
            })
            .collect();
        let index_bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": entries,
        }))
        .unwrap();
        self.processor
            .ingest_manifest(account, repo, media_types::OCI_INDEX, &index_bytes)
            .await
            .unwrap()
    }
}
