//! Integration tests for the SQLite metadata store: schema invariants,
//! pagination, and the mark-and-sweep primitives.

use keppel_metadata::models::*;
use keppel_metadata::repos::blobs::NewBlob;
use keppel_metadata::repos::{
    AccountRepo, BlobRepo, ManifestRepo, PeerRepo, RepoRepo, StorageSweepRepo,
};
use keppel_metadata::{MetadataError, SqliteStore};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

async fn store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("test.db")).await.unwrap();
    (dir, store)
}

fn t0() -> OffsetDateTime {
    datetime!(2024-06-01 12:00 UTC)
}

fn digest(seed: u8) -> String {
    format!("sha256:{}", hex_string(seed))
}

fn hex_string(seed: u8) -> String {
    format!("{:02x}", seed).repeat(32)
}

async fn create_account(store: &SqliteStore, name: &str) -> AccountRow {
    let account = AccountRow::new(name, "tenant1");
    store.create_account(&account).await.unwrap();
    account
}

async fn create_blob(store: &SqliteStore, account: &str, seed: u8) -> BlobRow {
    store
        .upsert_blob(&NewBlob {
            account_name: account.to_string(),
            digest: digest(seed),
            size_bytes: 1000 + seed as i64,
            storage_id: format!("storage-{seed}"),
            media_type: String::new(),
            pushed_at: t0(),
        })
        .await
        .unwrap()
}

fn manifest_row(repo_id: i64, seed: u8) -> ManifestRow {
    ManifestRow {
        repo_id,
        digest: digest(seed),
        media_type: "application/vnd.docker.distribution.manifest.v2+json".into(),
        size_bytes: 500,
        pushed_at: t0(),
        validated_at: t0(),
        validation_error_message: String::new(),
        last_pulled_at: None,
        next_vuln_check_at: None,
        vuln_status: "Pending".into(),
        vuln_scan_error: String::new(),
        labels_json: String::new(),
        gc_status_json: String::new(),
        min_layer_created_at: None,
        max_layer_created_at: None,
    }
}

#[tokio::test]
async fn test_account_crud_and_pagination() {
    let (_dir, store) = store().await;
    for i in 0..10 {
        create_account(&store, &format!("acct-{i}")).await;
    }

    // duplicate names are rejected
    let dup = AccountRow::new("acct-0", "tenant2");
    assert!(matches!(
        store.create_account(&dup).await,
        Err(MetadataError::AlreadyExists(_))
    ));

    // pagination: limit+1 fetching walks 10 accounts as 3+3+3+1
    let mut marker: Option<String> = None;
    let mut pages = Vec::new();
    loop {
        let rows = store.list_accounts(marker.as_deref(), 4).await.unwrap();
        let truncated = rows.len() > 3;
        let page: Vec<_> = rows.into_iter().take(3).collect();
        marker = page.last().map(|a| a.name.clone());
        pages.push(page.len());
        if !truncated {
            break;
        }
    }
    assert_eq!(pages, vec![3, 3, 3, 1]);

    // a dataset of exactly `limit` rows reports no truncation
    let rows = store.list_accounts(None, 11).await.unwrap();
    assert_eq!(rows.len(), 10);
}

#[tokio::test]
async fn test_blob_identity_is_per_account_digest() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    create_account(&store, "test2").await;

    let first = create_blob(&store, "test1", 1).await;
    let second = create_blob(&store, "test1", 1).await;
    assert_eq!(first.id, second.id, "same (account, digest) must share one row");
    assert_eq!(second.storage_id, "storage-1", "loser's storage id is discarded");

    let other_account = create_blob(&store, "test2", 1).await;
    assert_ne!(first.id, other_account.id);
}

#[tokio::test]
async fn test_cross_repo_mount_shares_one_blob() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo3 = store.get_or_create_repo("test1", "repo1-3").await.unwrap();
    let repo4 = store.get_or_create_repo("test1", "repo1-4").await.unwrap();

    let blob = create_blob(&store, "test1", 0x0f).await;
    store.mount_blob(blob.id, repo3.id).await.unwrap();
    store.mount_blob(blob.id, repo4.id).await.unwrap();

    let again = create_blob(&store, "test1", 0x0f).await;
    assert_eq!(blob.id, again.id);
    assert_eq!(store.list_blob_mounts(repo3.id).await.unwrap().len(), 1);
    assert_eq!(store.list_blob_mounts(repo4.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mount_into_foreign_account_is_not_found() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    create_account(&store, "test2").await;
    let foreign_repo = store.get_or_create_repo("test2", "repo").await.unwrap();
    let blob = create_blob(&store, "test1", 2).await;

    assert!(matches!(
        store.mount_blob(blob.id, foreign_repo.id).await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_manifest_quota_enforced_at_creation() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo = store.get_or_create_repo("test1", "repo1").await.unwrap();

    store
        .create_manifest(&manifest_row(repo.id, 1), b"{}", &[], &[], "tenant1", 2)
        .await
        .unwrap();
    store
        .create_manifest(&manifest_row(repo.id, 2), b"{}", &[], &[], "tenant1", 2)
        .await
        .unwrap();
    let err = store
        .create_manifest(&manifest_row(repo.id, 3), b"{}", &[], &[], "tenant1", 2)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MetadataError::QuotaExceeded { used: 2, limit: 2 }
    ));

    // re-pushing an existing manifest does not consume quota
    store
        .create_manifest(&manifest_row(repo.id, 1), b"{}", &[], &[], "tenant1", 2)
        .await
        .unwrap();
    assert_eq!(store.count_manifests_for_tenant("tenant1").await.unwrap(), 2);
}

#[tokio::test]
async fn test_tag_cascade_and_tag_delete_keeps_manifest() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo = store.get_or_create_repo("test1", "repo1").await.unwrap();
    store
        .create_manifest(&manifest_row(repo.id, 1), b"{}", &[], &[], "tenant1", 10)
        .await
        .unwrap();

    // tags must resolve to an existing manifest
    assert!(matches!(
        store.upsert_tag(repo.id, "dangling", &digest(9), t0()).await,
        Err(MetadataError::NotFound(_))
    ));

    store.upsert_tag(repo.id, "tag1", &digest(1), t0()).await.unwrap();

    // deleting the tag leaves the manifest
    assert!(store.delete_tag(repo.id, "tag1").await.unwrap());
    assert!(store.get_manifest(repo.id, &digest(1)).await.unwrap().is_some());

    // deleting the manifest cascades to its tags and content
    store.upsert_tag(repo.id, "tag1", &digest(1), t0()).await.unwrap();
    assert!(store.delete_manifest(repo.id, &digest(1)).await.unwrap());
    assert!(store.get_tag(repo.id, "tag1").await.unwrap().is_none());
    assert!(store
        .get_manifest_content(repo.id, &digest(1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_referenced_manifest_cannot_be_deleted() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo = store.get_or_create_repo("test1", "repo1").await.unwrap();

    // child first, then the index referencing it
    store
        .create_manifest(&manifest_row(repo.id, 1), b"{}", &[], &[], "tenant1", 10)
        .await
        .unwrap();
    store
        .create_manifest(
            &manifest_row(repo.id, 2),
            b"{}",
            &[],
            &[digest(1)],
            "tenant1",
            10,
        )
        .await
        .unwrap();

    let err = store.delete_manifest(repo.id, &digest(1)).await.unwrap_err();
    assert!(matches!(err, MetadataError::ManifestReferenced { .. }));

    // parent first, then the child goes through
    assert!(store.delete_manifest(repo.id, &digest(2)).await.unwrap());
    assert!(store.delete_manifest(repo.id, &digest(1)).await.unwrap());
}

#[tokio::test]
async fn test_mount_before_reference_is_enforced() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo = store.get_or_create_repo("test1", "repo1").await.unwrap();
    let blob = create_blob(&store, "test1", 1).await;

    // referencing an unmounted blob violates the restrict FK
    let err = store
        .create_manifest(
            &manifest_row(repo.id, 2),
            b"{}",
            &[blob.id],
            &[],
            "tenant1",
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Database(_)));

    store.mount_blob(blob.id, repo.id).await.unwrap();
    store
        .create_manifest(
            &manifest_row(repo.id, 2),
            b"{}",
            &[blob.id],
            &[],
            "tenant1",
            10,
        )
        .await
        .unwrap();

    // the mount now cannot be swept even if marked by force
    let refs = store.blobs_for_manifest(repo.id, &digest(2)).await.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].id, blob.id);
}

#[tokio::test]
async fn test_blob_mount_mark_unmark_sweep() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let repo = store.get_or_create_repo("test1", "repo1").await.unwrap();

    let referenced = create_blob(&store, "test1", 1).await;
    let orphan = create_blob(&store, "test1", 2).await;
    store.mount_blob(referenced.id, repo.id).await.unwrap();
    store.mount_blob(orphan.id, repo.id).await.unwrap();
    store
        .create_manifest(
            &manifest_row(repo.id, 3),
            b"{}",
            &[referenced.id],
            &[],
            "tenant1",
            10,
        )
        .await
        .unwrap();

    let now = t0();
    let marked = store
        .mark_unreferenced_blob_mounts(repo.id, now + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(marked, 1, "only the unreferenced mount is marked");
    store.unmark_referenced_blob_mounts(repo.id).await.unwrap();

    // nothing is due yet: the mark lies in the future
    assert_eq!(store.sweep_marked_blob_mounts(repo.id, now).await.unwrap(), 0);

    // one interval later the marked mount is swept
    let later = now + Duration::hours(1);
    assert_eq!(
        store.sweep_marked_blob_mounts(repo.id, later).await.unwrap(),
        1
    );
    assert_eq!(store.list_blob_mounts(repo.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_claim_respects_schedule_and_leases() {
    let (_dir, store) = store().await;
    create_account(&store, "acct-a").await;
    create_account(&store, "acct-b").await;

    let now = t0();
    let lease = now + Duration::minutes(5);

    // both accounts have NULL schedules; claims hand out disjoint accounts
    let first = store.claim_next_blob_sweep(now, lease).await.unwrap().unwrap();
    let second = store.claim_next_blob_sweep(now, lease).await.unwrap().unwrap();
    assert_ne!(first.name, second.name);

    // nothing else is due
    assert!(store.claim_next_blob_sweep(now, lease).await.unwrap().is_none());

    // after finishing, the accounts reschedule into the future
    store
        .set_next_blob_sweep_at(&first.name, now + Duration::hours(1))
        .await
        .unwrap();
    store
        .set_next_blob_sweep_at(&second.name, now + Duration::hours(10))
        .await
        .unwrap();
    assert!(store.claim_next_blob_sweep(now, lease).await.unwrap().is_none());

    // and becomes due again once the interval passes
    let later = now + Duration::hours(2);
    let reclaimed = store
        .claim_next_blob_sweep(later, later + Duration::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.name, first.name);
}

#[tokio::test]
async fn test_blob_mount_sweep_skips_poisoned_repos() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;
    let healthy = store.get_or_create_repo("test1", "healthy").await.unwrap();
    let poisoned = store.get_or_create_repo("test1", "poisoned").await.unwrap();

    let mut bad = manifest_row(poisoned.id, 1);
    bad.validation_error_message = "manifest parse error".into();
    store
        .create_manifest(&bad, b"{}", &[], &[], "tenant1", 10)
        .await
        .unwrap();
    store
        .set_manifest_validation(poisoned.id, &digest(1), None, "manifest parse error")
        .await
        .unwrap();

    let now = t0();
    let lease = now + Duration::minutes(5);
    let claimed = store
        .claim_next_blob_mount_sweep(now, lease)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, healthy.id);
    assert!(store
        .claim_next_blob_mount_sweep(now, lease)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_peer_claim_and_rotation() {
    let (_dir, store) = store().await;
    store.ensure_peer("keppel.example.org").await.unwrap();
    store.ensure_peer("keppel.example.org").await.unwrap(); // idempotent

    let now = t0();
    let cutoff = now - Duration::minutes(10);
    let peer = store.claim_next_peer(cutoff, now).await.unwrap().unwrap();
    assert_eq!(peer.hostname, "keppel.example.org");

    // claimed peer is not picked again within the cutoff
    assert!(store.claim_next_peer(cutoff, now).await.unwrap().is_none());

    store
        .rotate_peer_password("keppel.example.org", "hash-1")
        .await
        .unwrap();
    store
        .rotate_peer_password("keppel.example.org", "hash-2")
        .await
        .unwrap();
    let peer = store.get_peer("keppel.example.org").await.unwrap().unwrap();
    assert_eq!(peer.their_current_password_hash, "hash-2");
    assert_eq!(peer.their_previous_password_hash, "hash-1");
}

#[tokio::test]
async fn test_unknown_object_tombstones() {
    let (_dir, store) = store().await;
    create_account(&store, "test1").await;

    let now = t0();
    let grace = now + Duration::hours(4);
    store
        .upsert_unknown_blob("test1", "orphan-1", grace)
        .await
        .unwrap();
    // re-upserting keeps the original deadline
    store
        .upsert_unknown_blob("test1", "orphan-1", grace + Duration::hours(12))
        .await
        .unwrap();
    let tombstones = store.list_unknown_blobs("test1").await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].can_be_deleted_at, grace);

    assert!(store.delete_unknown_blob("test1", "orphan-1").await.unwrap());
    assert!(!store.delete_unknown_blob("test1", "orphan-1").await.unwrap());
}
