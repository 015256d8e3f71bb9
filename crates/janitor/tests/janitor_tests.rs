//! Integration tests for the janitor sweeps.

mod common;

use common::{start_time, TestEnv};
use keppel_core::federation::{AccountAnnouncement, ClaimResult, FederationDriver};
use keppel_core::vuln::VulnerabilityStatus;
use keppel_core::Digest;
use keppel_janitor::{PeerClient, TaskOutcome};
use keppel_metadata::repos::{
    AccountRepo, BlobRepo, ManifestRepo, PeerRepo, RepoRepo, StorageSweepRepo,
};
use keppel_processor::replication::BlobStream;
use keppel_storage::StorageDriver as _;
use keppel_processor::{ProcessorResult, ReplicationClient, UpstreamRef};
use std::sync::{Arc, Mutex};
use time::Duration;

// =============================================================================
// Blob-mount sweep
// =============================================================================

#[tokio::test]
async fn test_blob_mount_sweep_leaves_referenced_mounts_alone() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    env.push_image_manifest(&account, &repo, b"layer-a").await;
    let mounts_before = env.db.list_blob_mounts(repo.id).await.unwrap();

    let outcome = env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    assert_eq!(outcome, TaskOutcome::Processed);

    // no mount marked, count unchanged, schedule advanced by one hour
    let mounts = env.db.list_blob_mounts(repo.id).await.unwrap();
    assert_eq!(mounts.len(), mounts_before.len());
    assert!(mounts.iter().all(|m| m.can_be_deleted_at.is_none()));
    let repo = env.db.get_repo_by_id(repo.id).await.unwrap().unwrap();
    assert_eq!(
        repo.next_blob_mount_sweep_at.unwrap(),
        start_time() + Duration::hours(1)
    );

    // nothing else is due
    assert_eq!(
        env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap(),
        TaskOutcome::Idle
    );
}

#[tokio::test]
async fn test_blob_mount_sweep_removes_unreferenced_mount_after_one_interval() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    env.push_image_manifest(&account, &repo, b"layer-a").await;
    let orphan = env.push_blob_into_repo(&account, &repo, b"never-referenced").await;

    // pass 1: the orphan mount gets marked, but not yet deleted
    env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    let mount = env.db.get_blob_mount(orphan.id, repo.id).await.unwrap().unwrap();
    assert_eq!(
        mount.can_be_deleted_at.unwrap(),
        start_time() + Duration::minutes(30)
    );

    // pass 2 an hour later: still unreferenced, now swept
    env.clock.advance(Duration::hours(1) + Duration::minutes(1));
    env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    assert!(env.db.get_blob_mount(orphan.id, repo.id).await.unwrap().is_none());

    // referenced mounts survived both passes
    let mounts = env.db.list_blob_mounts(repo.id).await.unwrap();
    assert_eq!(mounts.len(), 2);
}

#[tokio::test]
async fn test_blob_mount_sweep_rescues_mount_that_becomes_referenced() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    env.push_image_manifest(&account, &repo, b"layer-a").await;
    let orphan = env.push_blob_into_repo(&account, &repo, b"late-manifest-layer").await;

    // pass 1 marks the mount
    env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    assert!(env
        .db
        .get_blob_mount(orphan.id, repo.id)
        .await
        .unwrap()
        .unwrap()
        .can_be_deleted_at
        .is_some());

    // the manifest for the blob arrives before the next pass
    env.push_image_manifest(&account, &repo, b"late-manifest-layer").await;

    env.clock.advance(Duration::hours(1) + Duration::minutes(1));
    env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    let mount = env.db.get_blob_mount(orphan.id, repo.id).await.unwrap().unwrap();
    assert!(mount.can_be_deleted_at.is_none(), "referenced mount must survive");
}

// =============================================================================
// Account blob sweep
// =============================================================================

#[tokio::test]
async fn test_blob_sweep_deletes_unmounted_blob_and_storage_object() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    env.push_image_manifest(&account, &repo, b"layer-kept").await;
    let kept = env
        .db
        .get_blob(&account.name, &Digest::compute(b"layer-kept").to_string())
        .await
        .unwrap()
        .unwrap();

    // an unmounted blob (e.g. its last mount was swept)
    let orphan = env.push_blob_into_repo(&account, &repo, b"orphaned-blob").await;

    // remove the orphan's mount through the mount sweep primitives; the
    // manifest-referenced mounts are immune to this
    env.db
        .mark_unreferenced_blob_mounts(repo.id, start_time() - Duration::minutes(1))
        .await
        .unwrap();
    env.db.unmark_referenced_blob_mounts(repo.id).await.unwrap();
    env.db
        .sweep_marked_blob_mounts(repo.id, start_time())
        .await
        .unwrap();
    assert!(env.db.get_blob_mount(orphan.id, repo.id).await.unwrap().is_none());

    // pass 1 marks the orphan blob
    env.janitor.sweep_blobs_in_next_account().await.unwrap();
    assert!(env
        .db
        .get_blob_by_id(orphan.id)
        .await
        .unwrap()
        .unwrap()
        .can_be_deleted_at
        .is_some());

    // pass 2 deletes the row and the storage object
    env.clock.advance(Duration::hours(1) + Duration::minutes(1));
    env.janitor.sweep_blobs_in_next_account().await.unwrap();
    assert!(env.db.get_blob_by_id(orphan.id).await.unwrap().is_none());
    assert!(env
        .storage
        .read_blob(&account.scope(), &orphan.storage_id)
        .await
        .is_err());

    // the mounted blob is untouched
    assert!(env.db.get_blob_by_id(kept.id).await.unwrap().is_some());
    assert!(env
        .storage
        .read_blob(&account.scope(), &kept.storage_id)
        .await
        .is_ok());
}

// =============================================================================
// Storage sweep
// =============================================================================

#[tokio::test]
async fn test_storage_sweep_deletes_orphan_objects_after_grace() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    let known = env.push_blob_into_repo(&account, &repo, b"known-blob").await;

    // an object that exists only in storage (e.g. crashed upload)
    let scope = account.scope();
    env.storage
        .append_to_blob(&scope, "orphan-object", 1, bytes::Bytes::from_static(b"junk"))
        .await
        .unwrap();
    env.storage.finalize_blob(&scope, "orphan-object", 1).await.unwrap();

    // pass 1: tombstoned, object still present
    env.janitor.sweep_storage_in_next_account().await.unwrap();
    let tombstones = env.db.list_unknown_blobs(&account.name).await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].storage_id, "orphan-object");
    assert!(env.storage.read_blob(&scope, "orphan-object").await.is_ok());

    // pass 2 after the sweep interval (grace has passed): deleted
    env.clock.advance(Duration::hours(6) + Duration::minutes(1));
    env.janitor.sweep_storage_in_next_account().await.unwrap();
    assert!(env.storage.read_blob(&scope, "orphan-object").await.is_err());
    assert!(env.db.list_unknown_blobs(&account.name).await.unwrap().is_empty());

    // the known blob is untouched
    assert!(env.storage.read_blob(&scope, &known.storage_id).await.is_ok());
}

// =============================================================================
// Manifest re-validation
// =============================================================================

#[tokio::test]
async fn test_validation_refreshes_and_poisons() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    let manifest = env.push_image_manifest(&account, &repo, b"layer-a").await;

    // fresh manifests are not re-validated
    assert_eq!(
        env.janitor.validate_next_manifest().await.unwrap(),
        TaskOutcome::Idle
    );

    // past the interval the manifest validates cleanly
    env.clock.advance(Duration::hours(27));
    assert_eq!(
        env.janitor.validate_next_manifest().await.unwrap(),
        TaskOutcome::Processed
    );
    let row = env.db.get_manifest(repo.id, &manifest.digest).await.unwrap().unwrap();
    assert_eq!(row.validated_at, env.clock.now());
    let validated_at = row.validated_at;

    // corrupt the stored content; the next validation poisons the manifest
    sqlx::query("UPDATE manifest_contents SET content = $1 WHERE repo_id = $2 AND digest = $3")
        .bind(b"garbage".as_slice())
        .bind(repo.id)
        .bind(&manifest.digest)
        .execute(env.db.pool())
        .await
        .unwrap();
    env.clock.advance(Duration::hours(27));
    assert!(env.janitor.validate_next_manifest().await.is_err());
    let row = env.db.get_manifest(repo.id, &manifest.digest).await.unwrap().unwrap();
    assert!(!row.validation_error_message.is_empty());
    assert_eq!(row.validated_at, validated_at, "validated_at must stay old on failure");

    // a poisoned manifest excludes its repo from the blob-mount sweep
    assert_eq!(
        env.janitor.sweep_blob_mounts_in_next_repo().await.unwrap(),
        TaskOutcome::Idle
    );
}

// =============================================================================
// Manifest GC
// =============================================================================

#[tokio::test]
async fn test_gc_deletes_untagged_and_keeps_tagged() {
    let env = TestEnv::new().await;
    let mut account = env.create_account("test1").await;
    account.gc_policies_json =
        r#"[{"match_repository": ".*", "strategy": "delete_untagged"}]"#.into();
    env.db.update_account(&account).await.unwrap();
    let repo = env.create_repo(&account, "repo1").await;

    let untagged = env.push_image_manifest(&account, &repo, b"layer-untagged").await;
    let tagged = env.push_image_manifest(&account, &repo, b"layer-tagged").await;
    env.processor
        .set_tag(&repo, "v1", &Digest::parse(&tagged.digest).unwrap())
        .await
        .unwrap();

    assert_eq!(
        env.janitor.collect_garbage_in_next_repo().await.unwrap(),
        TaskOutcome::Processed
    );

    assert!(env.db.get_manifest(repo.id, &untagged.digest).await.unwrap().is_none());
    let survivor = env.db.get_manifest(repo.id, &tagged.digest).await.unwrap().unwrap();
    assert!(survivor.gc_status_json.contains("relevant_policies"));
}

#[tokio::test]
async fn test_gc_protect_shields_from_deletion() {
    let env = TestEnv::new().await;
    let mut account = env.create_account("test1").await;
    account.gc_policies_json = r#"[
        {"match_repository": ".*", "match_tag": "keep-.*", "strategy": "protect"},
        {"match_repository": ".*",
         "time_constraint": {"on": "pushed_at", "older_than": 3600},
         "strategy": "delete_if_older_than"}
    ]"#
    .into();
    env.db.update_account(&account).await.unwrap();
    let repo = env.create_repo(&account, "repo1").await;

    let protected = env.push_image_manifest(&account, &repo, b"layer-keep").await;
    let doomed = env.push_image_manifest(&account, &repo, b"layer-doomed").await;
    env.processor
        .set_tag(&repo, "keep-1", &Digest::parse(&protected.digest).unwrap())
        .await
        .unwrap();
    env.processor
        .set_tag(&repo, "old-1", &Digest::parse(&doomed.digest).unwrap())
        .await
        .unwrap();

    env.clock.advance(Duration::hours(2));
    env.janitor.collect_garbage_in_next_repo().await.unwrap();

    let survivor = env.db.get_manifest(repo.id, &protected.digest).await.unwrap().unwrap();
    assert!(survivor.gc_status_json.contains("protected_by_policy"));
    assert!(env.db.get_manifest(repo.id, &doomed.digest).await.unwrap().is_none());
}

#[tokio::test]
async fn test_gc_defers_referenced_manifests_until_parent_is_collected() {
    let env = TestEnv::new().await;
    let mut account = env.create_account("test1").await;
    account.gc_policies_json =
        r#"[{"match_repository": ".*", "strategy": "delete_untagged"}]"#.into();
    env.db.update_account(&account).await.unwrap();
    let repo = env.create_repo(&account, "repo1").await;

    let child = env.push_image_manifest(&account, &repo, b"layer-child").await;
    let parent = env.push_index_manifest(&account, &repo, &[&child]).await;

    // one pass may only get the parent (the child is deferred while
    // referenced); after a second pass both are gone
    env.janitor.collect_garbage_in_next_repo().await.unwrap();
    env.clock.advance(Duration::hours(1) + Duration::minutes(1));
    env.janitor.collect_garbage_in_next_repo().await.unwrap();

    assert!(env.db.get_manifest(repo.id, &parent.digest).await.unwrap().is_none());
    assert!(env.db.get_manifest(repo.id, &child.digest).await.unwrap().is_none());
}

// =============================================================================
// Vulnerability checking
// =============================================================================

#[tokio::test]
async fn test_vuln_check_scans_image_manifest() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;
    let manifest = env.push_image_manifest(&account, &repo, b"layer-a").await;

    assert_eq!(
        env.janitor
            .check_vulnerabilities_for_next_manifest()
            .await
            .unwrap(),
        TaskOutcome::Processed
    );
    let row = env.db.get_manifest(repo.id, &manifest.digest).await.unwrap().unwrap();
    assert_eq!(row.vulnerability_status(), VulnerabilityStatus::Clean);
    assert_eq!(
        row.next_vuln_check_at.unwrap(),
        env.clock.now() + Duration::hours(1)
    );
}

#[tokio::test]
async fn test_vuln_check_merges_child_statuses_through_the_lattice() {
    let env = TestEnv::new().await;
    let account = env.create_account("test1").await;
    let repo = env.create_repo(&account, "repo1").await;

    let child1 = env.push_image_manifest(&account, &repo, b"layer-1").await;
    let child2 = env.push_image_manifest(&account, &repo, b"layer-2").await;
    let child3 = env.push_image_manifest(&account, &repo, b"layer-3").await;
    let index = env
        .push_index_manifest(&account, &repo, &[&child1, &child2, &child3])
        .await;

    // give the children fixed statuses and push their next checks far out
    // so the claim targets the index
    let far = env.clock.now() + Duration::days(30);
    for (child, status) in [
        (&child1, VulnerabilityStatus::Clean),
        (&child2, VulnerabilityStatus::High),
        (&child3, VulnerabilityStatus::Pending),
    ] {
        env.db
            .set_vuln_status(repo.id, &child.digest, status.as_str(), "", Some(far))
            .await
            .unwrap();
    }

    env.janitor
        .check_vulnerabilities_for_next_manifest()
        .await
        .unwrap();
    let row = env.db.get_manifest(repo.id, &index.digest).await.unwrap().unwrap();
    assert_eq!(row.vulnerability_status(), VulnerabilityStatus::Pending);
    // pending statuses re-check sooner
    assert_eq!(
        row.next_vuln_check_at.unwrap(),
        env.clock.now() + Duration::minutes(30)
    );

    // one child degrades to Error; the next check rolls that up
    env.db
        .set_vuln_status(
            repo.id,
            &child3.digest,
            VulnerabilityStatus::Error.as_str(),
            "scanner exploded",
            Some(far),
        )
        .await
        .unwrap();
    env.clock.advance(Duration::minutes(31));
    env.janitor
        .check_vulnerabilities_for_next_manifest()
        .await
        .unwrap();
    let row = env.db.get_manifest(repo.id, &index.digest).await.unwrap().unwrap();
    assert_eq!(row.vulnerability_status(), VulnerabilityStatus::Error);
}

// =============================================================================
// Federation announcements and peering
// =============================================================================

#[derive(Default)]
struct RecordingFederation {
    announced: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl FederationDriver for RecordingFederation {
    async fn claim_account_name(
        &self,
        _account_name: &str,
        _auth_tenant_id: &str,
        _sublease_token: Option<&str>,
    ) -> keppel_core::Result<ClaimResult> {
        Ok(ClaimResult::Granted)
    }

    async fn issue_sublease_token(&self, _account_name: &str) -> keppel_core::Result<String> {
        Ok(String::new())
    }

    async fn announce_account(
        &self,
        announcement: &AccountAnnouncement,
    ) -> keppel_core::Result<()> {
        self.announced.lock().unwrap().push(announcement.name.clone());
        Ok(())
    }

    async fn forfeit_account_name(&self, _account_name: &str) -> keppel_core::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_federation_announcements_cover_all_accounts() {
    let federation = Arc::new(RecordingFederation::default());
    let env = TestEnv::with_drivers(
        federation.clone(),
        Arc::new(keppel_janitor::TrivialScanner),
    )
    .await;
    env.create_account("acct-a").await;
    env.create_account("acct-b").await;

    assert_eq!(
        env.janitor.announce_next_account_to_federation().await.unwrap(),
        TaskOutcome::Processed
    );
    assert_eq!(
        env.janitor.announce_next_account_to_federation().await.unwrap(),
        TaskOutcome::Processed
    );
    assert_eq!(
        env.janitor.announce_next_account_to_federation().await.unwrap(),
        TaskOutcome::Idle
    );

    let mut announced = federation.announced.lock().unwrap().clone();
    announced.sort();
    assert_eq!(announced, vec!["acct-a".to_string(), "acct-b".to_string()]);
}

#[derive(Default)]
struct RecordingPeerClient {
    submissions: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl PeerClient for RecordingPeerClient {
    async fn submit_peering_credentials(
        &self,
        peer_hostname: &str,
        _our_hostname: &str,
        password: &str,
    ) -> Result<(), String> {
        self.submissions
            .lock()
            .unwrap()
            .push((peer_hostname.to_string(), password.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_peering_rotates_and_submits_password() {
    let env = TestEnv::new().await;
    env.db.ensure_peer("keppel-other.example.org").await.unwrap();

    let client = RecordingPeerClient::default();
    assert_eq!(
        env.janitor
            .issue_password_for_next_peer(&client, "keppel-us.example.org")
            .await
            .unwrap(),
        TaskOutcome::Processed
    );

    let submissions = client.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, "keppel-other.example.org");

    // the stored hash matches the submitted password, and the plaintext
    // is kept as our_password for authenticating against the peer
    use sha2::Digest as _;
    let expected_hash = hex::encode(sha2::Sha256::digest(submissions[0].1.as_bytes()));
    let peer = env.db.get_peer("keppel-other.example.org").await.unwrap().unwrap();
    assert_eq!(peer.their_current_password_hash, expected_hash);
    assert_eq!(peer.our_password, submissions[0].1);
    assert_eq!(peer.last_peered_at.unwrap(), env.clock.now());

    // freshly rotated peers are not picked again
    assert_eq!(
        env.janitor
            .issue_password_for_next_peer(&client, "keppel-us.example.org")
            .await
            .unwrap(),
        TaskOutcome::Idle
    );
}

// =============================================================================
// Manifest sync for replicas
// =============================================================================

/// An upstream that has lost all its manifests.
struct EmptyUpstream;

#[async_trait::async_trait]
impl ReplicationClient for EmptyUpstream {
    async fn fetch_manifest(
        &self,
        _upstream: &UpstreamRef,
        _repo_path: &str,
        reference: &str,
    ) -> ProcessorResult<(String, Vec<u8>)> {
        Err(keppel_processor::error::registry_error(
            keppel_core::RegistryErrorCode::ManifestUnknown,
            format!("no manifest {reference}"),
        ))
    }

    async fn manifest_exists(
        &self,
        _upstream: &UpstreamRef,
        _repo_path: &str,
        _reference: &str,
    ) -> ProcessorResult<bool> {
        Ok(false)
    }

    async fn fetch_blob(
        &self,
        _upstream: &UpstreamRef,
        _repo_path: &str,
        digest: &str,
    ) -> ProcessorResult<BlobStream> {
        Err(keppel_processor::error::registry_error(
            keppel_core::RegistryErrorCode::BlobUnknown,
            format!("no blob {digest}"),
        ))
    }
}

#[tokio::test]
async fn test_manifest_sync_deletes_vanished_manifests() {
    let env = TestEnv::new().await;
    let mut account = env.create_account("replica1").await;
    account.upstream_peer_hostname = "keppel-primary.example.org".into();
    env.db.update_account(&account).await.unwrap();
    let repo = env.create_repo(&account, "library/app").await;
    let manifest = env.push_image_manifest(&account, &repo, b"layer-a").await;

    assert_eq!(
        env.janitor.sync_manifests_in_next_repo(&EmptyUpstream).await.unwrap(),
        TaskOutcome::Processed
    );
    assert!(env.db.get_manifest(repo.id, &manifest.digest).await.unwrap().is_none());

    // primary accounts are never picked up by the sync
    let primary = env.create_account("primary1").await;
    let primary_repo = env.create_repo(&primary, "repo").await;
    let primary_manifest = env
        .push_image_manifest(&primary, &primary_repo, b"layer-b")
        .await;
    env.clock.advance(Duration::hours(2));
    // the replica repo is due again but empty; the primary repo is not eligible
    assert_eq!(
        env.janitor.sync_manifests_in_next_repo(&EmptyUpstream).await.unwrap(),
        TaskOutcome::Processed
    );
    assert_eq!(
        env.janitor.sync_manifests_in_next_repo(&EmptyUpstream).await.unwrap(),
        TaskOutcome::Idle
    );
    assert!(env
        .db
        .get_manifest(primary_repo.id, &primary_manifest.digest)
        .await
        .unwrap()
        .is_some());
}
