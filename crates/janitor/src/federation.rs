//! Federation announcements and peer password rotation.

use crate::{Janitor, TaskError, TaskOutcome, TaskResult, CLAIM_LEASE};
use async_trait::async_trait;
use keppel_core::federation::AccountAnnouncement;
use keppel_metadata::repos::{AccountRepo, PeerRepo};
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use time::Duration;

/// Accounts are announced to the federation every hour.
pub const ANNOUNCEMENT_INTERVAL: Duration = Duration::hours(1);

/// A peer gets a fresh password when its last rotation is older than this.
pub const PEERING_CUTOFF: Duration = Duration::minutes(10);

/// The peering endpoint of another Keppel instance.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Tell the peer the new password it shall use when talking to us.
    async fn submit_peering_credentials(
        &self,
        peer_hostname: &str,
        our_hostname: &str,
        password: &str,
    ) -> Result<(), String>;
}

/// `PeerClient` over HTTPS.
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(call_timeout: std::time::Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn submit_peering_credentials(
        &self,
        peer_hostname: &str,
        our_hostname: &str,
        password: &str,
    ) -> Result<(), String> {
        let url = format!("https://{peer_hostname}/keppel/v1/auth/peering");
        let body = serde_json::json!({
            "peer": our_hostname,
            "password": password,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("POST {url} returned status {}", response.status()));
        }
        Ok(())
    }
}

impl Janitor {
    /// Announce the next due account's state to the federation driver.
    pub async fn announce_next_account_to_federation(&self) -> TaskResult {
        let now = self.now();
        let Some(account) = self
            .db()
            .claim_next_federation_announcement(now, now + CLAIM_LEASE)
            .await?
        else {
            return Ok(TaskOutcome::Idle);
        };

        let announcement = AccountAnnouncement {
            name: account.name.clone(),
            auth_tenant_id: account.auth_tenant_id.clone(),
            upstream_peer_hostname: account.upstream_peer_hostname.clone(),
            in_maintenance: account.in_maintenance,
            observed_at: now,
        };
        match self.federation().announce_account(&announcement).await {
            Ok(()) => {
                self.db()
                    .set_next_federation_announcement_at(
                        &account.name,
                        now + ANNOUNCEMENT_INTERVAL,
                    )
                    .await?;
                Ok(TaskOutcome::Processed)
            }
            Err(err) => Err(TaskError::Peer(err.to_string()).in_context(format!(
                "while announcing account {} to federation",
                account.name
            ))),
        }
    }

    /// Issue a new `our_password` to the next peer whose rotation is due:
    /// the plaintext is stored on our row (replication pulls against the
    /// peer authenticate with it) and its hash enters the one-step
    /// rotation history. Both are committed before the peer is informed:
    /// if the submit fails, the peer keeps using its previous password,
    /// which stays accepted through the history.
    pub async fn issue_password_for_next_peer(
        &self,
        client: &dyn PeerClient,
        our_hostname: &str,
    ) -> TaskResult {
        let now = self.now();
        let Some(peer) = self.db().claim_next_peer(now - PEERING_CUTOFF, now).await? else {
            return Ok(TaskOutcome::Idle);
        };

        let mut password_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut password_bytes);
        let password = hex::encode(password_bytes);
        let password_hash = hex::encode(Sha256::digest(password.as_bytes()));

        self.db()
            .rotate_peer_password(&peer.hostname, &password_hash)
            .await?;
        self.db().set_our_password(&peer.hostname, &password).await?;
        match client
            .submit_peering_credentials(&peer.hostname, our_hostname, &password)
            .await
        {
            Ok(()) => {
                tracing::info!(peer = %peer.hostname, "issued new peering password");
                Ok(TaskOutcome::Processed)
            }
            Err(err) => Err(TaskError::Peer(err).in_context(format!(
                "while issuing a new password for peer {}",
                peer.hostname
            ))),
        }
    }
}
