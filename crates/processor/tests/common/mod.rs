//! Common test utilities for processor tests.

use bytes::Bytes;
use keppel_core::manifest::media_types;
use keppel_core::{Digest, NullAuditor};
use keppel_metadata::models::{AccountRow, BlobRow, QuotaRow, RepoRow};
use keppel_metadata::repos::blobs::NewBlob;
use keppel_metadata::repos::{AccountRepo, BlobRepo, QuotaRepo, RepoRepo};
use keppel_metadata::SqliteStore;
use keppel_processor::{Clock, Processor};
use keppel_storage::{MemoryDriver, StorageDriver as _};
use std::sync::{Arc, Mutex};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// An adjustable time source shared between the test and the processor.
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
    pub processor: Processor,
    pub clock: TestClock,
    _temp_dir: tempfile::TempDir,
}

pub fn start_time() -> OffsetDateTime {
    datetime!(2024-06-01 12:00 UTC)
}

impl TestEnv {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
        let db = Arc::new(
            SqliteStore::new(temp_dir.path().join("test.db"))
                .await
                .expect("failed to create metadata store"),
        );
        let storage = Arc::new(MemoryDriver::new());
        let clock = TestClock::new(start_time());
        let processor = Processor::new(db.clone(), storage.clone(), Arc::new(NullAuditor))
            .with_clock(clock.as_clock());
        Self {
            db,
            storage,
            processor,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Create an account with a generous manifest quota.
    pub async fn create_account(&self, name: &str) -> AccountRow {
        self.create_account_with_quota(name, 100).await
    }

    pub async fn create_account_with_quota(&self, name: &str, manifests: i64) -> AccountRow {
        let account = AccountRow::new(name, "tenant1");
        self.db.create_account(&account).await.unwrap();
        self.db
            .set_quota(&QuotaRow {
                auth_tenant_id: "tenant1".into(),
                manifests,
            })
            .await
            .unwrap();
        account
    }

    pub async fn create_repo(&self, account: &AccountRow, name: &str) -> RepoRow {
        self.db.get_or_create_repo(&account.name, name).await.unwrap()
    }

    /// Push a blob: write the content to storage and register the row.
    /// Does not mount it anywhere.
    pub async fn push_blob(&self, account: &AccountRow, content: &[u8]) -> BlobRow {
        let digest = Digest::compute(content);
        let storage_id = uuid::Uuid::new_v4().simple().to_string();
        let scope = account.scope();
        self.storage
            .append_to_blob(&scope, &storage_id, 1, Bytes::copy_from_slice(content))
            .await
            .unwrap();
        self.storage.finalize_blob(&scope, &storage_id, 1).await.unwrap();
        self.db
            .upsert_blob(&NewBlob {
                account_name: account.name.clone(),
                digest: digest.to_string(),
                size_bytes: content.len() as i64,
                storage_id,
                media_type: String::new(),
                pushed_at: self.clock.now(),
            })
            .await
            .unwrap()
    }

    /// Push a blob and mount it into the repo.
    pub async fn push_blob_into_repo(
        &self,
        account: &AccountRow,
        repo: &RepoRow,
        content: &[u8],
    ) -> BlobRow {
        let blob = self.push_blob(account, content).await;
        self.db.mount_blob(blob.id, repo.id).await.unwrap();
        blob
    }
}

/// A minimal image config blob with the given labels.
pub fn image_config_bytes(labels: &[(&str, &str)]) -> Vec<u8> {
    let labels: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "created": "2024-03-01T10:00:00Z",
        "config": {"Labels": labels},
        "history": [
            {"created": "2024-01-01T00:00:00Z"},
            {"created": "2024-02-01T00:00:00Z"},
        ],
    }))
    .unwrap()
}

/// Docker schema2 image manifest bytes for one config and some layers.
pub fn image_manifest_bytes(config: &[u8], layers: &[&[u8]]) -> Vec<u8> {
    let layer_entries: Vec<serde_json::Value> = layers
        .iter()
        .map(|content| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": Digest::compute(content).to_string(),
                "size": content.len(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST,
        "config": {
            "mediaType": media_types::DOCKER_IMAGE_CONFIG,
            "digest": Digest::compute(config).to_string(),
            "size": config.len(),
        },
        "layers": layer_entries,
    }))
    .unwrap()
}

/// OCI index bytes for the given child manifest bytes.
pub fn index_manifest_bytes(children: &[&[u8]]) -> Vec<u8> {
    let entries: Vec<serde_json::Value> = children
        .iter()
        .map(|content| {
            serde_json::json!({
                "mediaType": media_types::OCI_MANIFEST,
                "digest": Digest::compute(content).to_string(),
                "size": content.len(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_INDEX,
        "manifests": entries,
    }))
    .unwrap()
}
