//! Manifest sync for replica accounts: drop local manifests that the
//! upstream no longer has.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use keppel_core::{Digest, RegistryErrorCode};
use keppel_metadata::models::RepoRow;
use keppel_metadata::repos::{AccountRepo, ManifestRepo, PeerRepo, RepoRepo};
use keppel_metadata::MetadataError;
use keppel_processor::{ReplicationClient, UpstreamRef};
use time::Duration;

/// Replica repos sync against their upstream every hour.
pub const MANIFEST_SYNC_INTERVAL: Duration = Duration::hours(1);

impl Janitor {
    /// Sync the next due replica repo: any local manifest that no longer
    /// exists upstream is deleted (tags cascade). Deletion order follows
    /// the reference structure: a manifest still referenced by a parent
    /// index is deferred until the parent is gone.
    pub async fn sync_manifests_in_next_repo(
        &self,
        client: &dyn ReplicationClient,
    ) -> TaskResult {
        let now = self.now();
        let Some(repo) = self
            .db()
            .claim_next_manifest_sync(now, now + CLAIM_LEASE)
            .await?
        else {
            return Ok(TaskOutcome::Idle);
        };

        let result = self.sync_manifests_in_repo(client, &repo).await;
        match result {
            Ok(()) => {
                self.db()
                    .set_next_manifest_sync_at(repo.id, now + MANIFEST_SYNC_INTERVAL)
                    .await?;
                Ok(TaskOutcome::Processed)
            }
            Err(err) => Err(err.in_context(format!(
                "while syncing manifests in repo {}",
                repo.full_name()
            ))),
        }
    }

    async fn sync_manifests_in_repo(
        &self,
        client: &dyn ReplicationClient,
        repo: &RepoRow,
    ) -> Result<(), TaskError> {
        let account = self
            .db()
            .get_account(&repo.account_name)
            .await?
            .ok_or_else(|| {
                TaskError::Metadata(MetadataError::Internal(format!(
                    "repo {} references missing account",
                    repo.full_name()
                )))
            })?;
        if account.in_maintenance {
            return Ok(());
        }

        let peer_password = match self.db().get_peer(&account.upstream_peer_hostname).await? {
            Some(peer) => Some(peer.our_password),
            None => None,
        };
        let Some(upstream) = UpstreamRef::for_account(&account, peer_password.as_deref()) else {
            // not a replica after all (account was edited mid-claim)
            return Ok(());
        };

        for manifest in self.db().list_manifests(repo.id).await? {
            let exists = client
                .manifest_exists(&upstream, &repo.full_name(), &manifest.digest)
                .await
                .map_err(TaskError::Processor)?;
            if exists {
                continue;
            }
            let digest = Digest::parse(&manifest.digest).map_err(TaskError::from)?;
            match self.processor().delete_manifest(&account, repo, &digest).await {
                Ok(()) => {
                    tracing::info!(
                        repo = %repo.full_name(), digest = %manifest.digest,
                        "manifest deleted: upstream does not have it anymore"
                    );
                }
                Err(err)
                    if err.registry_code() == Some(RegistryErrorCode::ManifestReferenced) =>
                {
                    tracing::debug!(
                        repo = %repo.full_name(), digest = %manifest.digest,
                        "manifest sync deferred: manifest is still referenced"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
