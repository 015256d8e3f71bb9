//! Peer repository.

use crate::error::MetadataResult;
use crate::models::PeerRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for mutual-peering credentials.
#[async_trait]
pub trait PeerRepo: Send + Sync {
    /// Register a peer hostname if not already present.
    async fn ensure_peer(&self, hostname: &str) -> MetadataResult<()>;

    async fn get_peer(&self, hostname: &str) -> MetadataResult<Option<PeerRow>>;

    async fn list_peers(&self) -> MetadataResult<Vec<PeerRow>>;

    /// Claim the peer whose `last_peered_at` is NULL or older than
    /// `cutoff`, setting `last_peered_at = now` in the same transaction so
    /// concurrent janitors pick disjoint peers and a failed rotation
    /// retries after the normal cutoff.
    async fn claim_next_peer(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<PeerRow>>;

    /// Rotate the password the peer uses towards us:
    /// `their_previous ← their_current`, `their_current ← new_hash`.
    async fn rotate_peer_password(
        &self,
        hostname: &str,
        new_password_hash: &str,
    ) -> MetadataResult<()>;

    /// Store the password we present to the peer (set when the peer
    /// issues us a new one).
    async fn set_our_password(&self, hostname: &str, password: &str) -> MetadataResult<()>;
}
