//! Integration tests for the processor: uploads, manifest ingestion,
//! tags, deletes, and replication.

mod common;

use bytes::Bytes;
use common::{image_config_bytes, image_manifest_bytes, index_manifest_bytes, TestEnv};
use keppel_core::manifest::media_types;
use keppel_core::{Digest, ManifestReference, RegistryErrorCode};
use keppel_metadata::repos::{AccountRepo, BlobRepo, ManifestRepo, UploadRepo};
use keppel_processor::ProcessorError;
use keppel_storage::StorageDriver as _;

fn assert_code(err: &ProcessorError, code: RegistryErrorCode) {
    assert_eq!(err.registry_code(), Some(code), "unexpected error: {err}");
}

#[tokio::test]
async fn test_upload_lifecycle() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let upload = env.processor.begin_upload(&repo).await.unwrap();
    let upload = env
        .processor
        .append_chunk(&account, &upload, Bytes::from_static(b"hello "))
        .await
        .unwrap();
    let upload = env
        .processor
        .append_chunk(&account, &upload, Bytes::from_static(b"world"))
        .await
        .unwrap();
    assert_eq!(upload.num_chunks, 2);
    assert_eq!(upload.size_bytes, 11);

    let digest = Digest::compute(b"hello world");
    let blob = env
        .processor
        .finalize_upload(&account, &repo, &upload, &digest, "application/octet-stream")
        .await
        .unwrap();
    assert_eq!(blob.size_bytes, 11);
    assert_eq!(blob.digest, digest.to_string());

    // the upload row is gone, the blob is mounted and readable
    assert!(env.db.get_upload(repo.id, upload.uuid).await.unwrap().is_none());
    assert!(env.db.get_blob_mount(blob.id, repo.id).await.unwrap().is_some());
    let (_, size) = env
        .storage
        .read_blob(&account.scope(), &blob.storage_id)
        .await
        .unwrap();
    assert_eq!(size, 11);
}

#[tokio::test]
async fn test_upload_digest_mismatch_discards_everything() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let upload = env.processor.begin_upload(&repo).await.unwrap();
    let upload = env
        .processor
        .append_chunk(&account, &upload, Bytes::from_static(b"some data"))
        .await
        .unwrap();
    let wrong_digest = Digest::compute(b"different data");
    let err = env
        .processor
        .finalize_upload(&account, &repo, &upload, &wrong_digest, "")
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::DigestInvalid);

    assert!(env.db.get_upload(repo.id, upload.uuid).await.unwrap().is_none());
    let (blobs, _) = env
        .storage
        .list_storage_contents(&account.scope())
        .await
        .unwrap();
    assert!(blobs.is_empty(), "failed upload must not leave objects behind");
}

#[tokio::test]
async fn test_cross_repo_mount_shares_blob_and_storage() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo3 = env.create_repo(&account, "repo1-3").await;
    let repo4 = env.create_repo(&account, "repo1-4").await;

    let content = vec![0x42u8; 2000];
    let blob = env.push_blob_into_repo(&account, &repo3, &content).await;
    let digest = Digest::compute(&content);
    let mounted = env
        .processor
        .mount_blob_into_repo(&account, &repo4, &digest)
        .await
        .unwrap();
    assert_eq!(blob.id, mounted.id);

    // one blob row, two mounts, one storage object
    assert_eq!(env.db.list_blob_mounts(repo3.id).await.unwrap().len(), 1);
    assert_eq!(env.db.list_blob_mounts(repo4.id).await.unwrap().len(), 1);
    let (blobs, _) = env
        .storage
        .list_storage_contents(&account.scope())
        .await
        .unwrap();
    assert_eq!(blobs.len(), 1);

    assert!(env
        .processor
        .find_blob_in_repo(&account, &repo4, &digest)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_mount_unknown_blob_fails() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    let err = env
        .processor
        .mount_blob_into_repo(&account, &repo, &Digest::compute(b"nope"))
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::BlobUnknown);
}

#[tokio::test]
async fn test_ingest_manifest_extracts_labels_and_timestamps() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[("maintainer", "ops"), ("stage", "prod")]);
    let layer = b"layer-data".as_slice();
    env.push_blob(&account, &config).await;
    let layer_blob = env.push_blob(&account, layer).await;
    let manifest_bytes = image_manifest_bytes(&config, &[layer]);

    let manifest = env
        .processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, &manifest_bytes)
        .await
        .unwrap();

    assert_eq!(manifest.digest, Digest::compute(&manifest_bytes).to_string());
    assert_eq!(manifest.vuln_status, "Pending");
    assert!(manifest.next_vuln_check_at.is_none());
    assert!(manifest.labels_json.contains("maintainer"));
    assert_eq!(manifest.min_layer_created_at.unwrap().month() as u8, 1);
    assert_eq!(manifest.max_layer_created_at.unwrap().month() as u8, 3);

    // blobs were auto-mounted and referenced
    assert!(env
        .db
        .get_blob_mount(layer_blob.id, repo.id)
        .await
        .unwrap()
        .is_some());
    let refs = env
        .db
        .blobs_for_manifest(repo.id, &manifest.digest)
        .await
        .unwrap();
    assert_eq!(refs.len(), 2);

    // the bytes landed in both the content table and the storage driver
    assert_eq!(
        env.db
            .get_manifest_content(repo.id, &manifest.digest)
            .await
            .unwrap()
            .unwrap(),
        manifest_bytes
    );
    assert_eq!(
        env.storage
            .read_manifest(&account.scope(), &repo.name, &manifest.digest)
            .await
            .unwrap(),
        manifest_bytes
    );
}

#[tokio::test]
async fn test_ingest_rejects_unknown_references() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[]);
    let manifest_bytes = image_manifest_bytes(&config, &[b"never-pushed"]);
    let err = env
        .processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, &manifest_bytes)
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::BlobUnknown);

    let index_bytes = index_manifest_bytes(&[b"no-such-child-manifest"]);
    let err = env
        .processor
        .ingest_manifest(&account, &repo, media_types::OCI_INDEX, &index_bytes)
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestUnknown);

    let err = env
        .processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, b"not json")
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestInvalid);
}

#[tokio::test]
async fn test_ingest_enforces_required_labels() {
    let env = TestEnv::new().await;
    let mut account = env.create_account("test1").await;
    account.required_labels = "maintainer,source-repo".into();
    env.db.update_account(&account).await.unwrap();
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[("maintainer", "ops")]);
    env.push_blob(&account, &config).await;
    let layer = b"layer".as_slice();
    env.push_blob(&account, layer).await;
    let manifest_bytes = image_manifest_bytes(&config, &[layer]);

    let err = env
        .processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, &manifest_bytes)
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestInvalid);
    assert!(err.to_string().contains("source-repo"));
}

#[tokio::test]
async fn test_ingest_enforces_quota() {
    let env = TestEnv::new().await;
    let account = env.create_account_with_quota("test1", 1).await;
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[]);
    env.push_blob(&account, &config).await;
    let layer1 = b"layer-one".as_slice();
    let layer2 = b"layer-two".as_slice();
    env.push_blob(&account, layer1).await;
    env.push_blob(&account, layer2).await;

    env.processor
        .ingest_manifest(
            &account,
            &repo,
            media_types::DOCKER_MANIFEST,
            &image_manifest_bytes(&config, &[layer1]),
        )
        .await
        .unwrap();
    let err = env
        .processor
        .ingest_manifest(
            &account,
            &repo,
            media_types::DOCKER_MANIFEST,
            &image_manifest_bytes(&config, &[layer2]),
        )
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::QuotaExceeded);
}

#[tokio::test]
async fn test_tag_delete_keeps_manifest() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[]);
    env.push_blob(&account, &config).await;
    let layer = b"layer".as_slice();
    env.push_blob(&account, layer).await;
    let manifest_bytes = image_manifest_bytes(&config, &[layer]);
    let manifest = env
        .processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, &manifest_bytes)
        .await
        .unwrap();
    let digest = Digest::parse(&manifest.digest).unwrap();

    env.processor.set_tag(&repo, "tag1", &digest).await.unwrap();
    env.processor.delete_tag(&repo, "tag1").await.unwrap();

    // the manifest is still pullable by digest
    assert!(env
        .db
        .get_manifest(repo.id, &manifest.digest)
        .await
        .unwrap()
        .is_some());

    // record_pull by digest updates last_pulled_at
    env.processor
        .record_pull(&repo, &ManifestReference::Digest(digest.clone()))
        .await
        .unwrap();
    let row = env
        .db
        .get_manifest(repo.id, &manifest.digest)
        .await
        .unwrap()
        .unwrap();
    assert!(row.last_pulled_at.is_some());

    // deleting a missing tag is ManifestUnknown
    let err = env.processor.delete_tag(&repo, "tag1").await.unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestUnknown);
}

#[tokio::test]
async fn test_mutating_operations_are_counted() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;

    let success = keppel_processor::metrics::OPERATIONS
        .with_label_values(&["register_blob", "success"]);
    let before = success.get();
    env.processor
        .register_blob(&account, &Digest::compute(b"counted"), 7, "storage-counted", "")
        .await
        .unwrap();
    assert!(success.get() > before);

    let repo = env.create_repo(&account, "repo1").await;
    let failure = keppel_processor::metrics::OPERATIONS
        .with_label_values(&["delete_tag", "failure"]);
    let before = failure.get();
    assert!(env.processor.delete_tag(&repo, "missing").await.is_err());
    assert!(failure.get() > before);
}

#[tokio::test]
async fn test_delete_referenced_manifest_is_rejected() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let config = image_config_bytes(&[]);
    env.push_blob(&account, &config).await;
    let layer = b"layer".as_slice();
    env.push_blob(&account, layer).await;
    let child_bytes = image_manifest_bytes(&config, &[layer]);
    env.processor
        .ingest_manifest(&account, &repo, media_types::DOCKER_MANIFEST, &child_bytes)
        .await
        .unwrap();
    let index_bytes = index_manifest_bytes(&[child_bytes.as_slice()]);
    env.processor
        .ingest_manifest(&account, &repo, media_types::OCI_INDEX, &index_bytes)
        .await
        .unwrap();

    let child_digest = Digest::compute(&child_bytes);
    let parent_digest = Digest::compute(&index_bytes);

    let err = env
        .processor
        .delete_manifest(&account, &repo, &child_digest)
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestReferenced);

    env.processor
        .delete_manifest(&account, &repo, &parent_digest)
        .await
        .unwrap();
    env.processor
        .delete_manifest(&account, &repo, &child_digest)
        .await
        .unwrap();

    let err = env
        .processor
        .delete_manifest(&account, &repo, &child_digest)
        .await
        .unwrap_err();
    assert_code(&err, RegistryErrorCode::ManifestUnknown);
}
