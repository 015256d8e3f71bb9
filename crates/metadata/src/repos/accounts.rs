//! Account repository.

use crate::error::MetadataResult;
use crate::models::AccountRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for account operations.
///
/// The `claim_next_*` methods implement the shared janitor scheduling
/// pattern: select the account whose `next_*_at` is NULL or furthest past
/// due (NULL first), lock it against concurrent janitors, and bump the
/// timestamp to `lease_until` so a crashed worker's claim expires on its
/// own. The sweeper overwrites the timestamp with the real interval after
/// successful work.
#[async_trait]
pub trait AccountRepo: Send + Sync {
    /// Create an account. Fails with `AlreadyExists` on name collision.
    async fn create_account(&self, account: &AccountRow) -> MetadataResult<()>;

    async fn get_account(&self, name: &str) -> MetadataResult<Option<AccountRow>>;

    /// List accounts ordered by name, starting strictly after `marker`.
    /// Fetches at most `limit` rows; callers request one more row than the
    /// page size to detect truncation.
    async fn list_accounts(
        &self,
        marker: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<AccountRow>>;

    /// Update all mutable account attributes.
    async fn update_account(&self, account: &AccountRow) -> MetadataResult<()>;

    /// Delete the account row. Child rows must already be gone; the FK
    /// structure rejects anything else.
    async fn delete_account(&self, name: &str) -> MetadataResult<bool>;

    async fn claim_next_blob_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>>;

    async fn set_next_blob_sweep_at(
        &self,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn claim_next_storage_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>>;

    async fn set_next_storage_sweep_at(
        &self,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;

    async fn claim_next_federation_announcement(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>>;

    async fn set_next_federation_announcement_at(
        &self,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;
}
