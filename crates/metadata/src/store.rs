//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{
    AccountRepo, BlobRepo, ManifestRepo, PeerRepo, QuotaRepo, RepoRepo, StorageSweepRepo,
    UploadRepo,
};
use crate::repos::blobs::NewBlob;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait: all repositories plus lifecycle.
#[async_trait]
pub trait MetadataStore:
    AccountRepo
    + RepoRepo
    + BlobRepo
    + ManifestRepo
    + UploadRepo
    + QuotaRepo
    + PeerRepo
    + StorageSweepRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Split an embedded schema into single statements; neither backend
/// executes multi-statement prepared queries.
pub(crate) fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// SQLite-based metadata store, for tests and single-node development.
///
/// The pool is restricted to one connection: SQLite permits only limited
/// write concurrency, and the skip-locked claim semantics of the janitor
/// degrade gracefully to plain selection when there is only one writer.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetadataError::Config(e.to_string()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(MetadataError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        for statement in schema_statements(SCHEMA_SQL) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[async_trait]
impl AccountRepo for SqliteStore {
    async fn create_account(&self, account: &AccountRow) -> MetadataResult<()> {
        if self.get_account(&account.name).await?.is_some() {
            return Err(MetadataError::AlreadyExists(format!(
                "account {}",
                account.name
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO accounts (
                name, auth_tenant_id, upstream_peer_hostname,
                external_peer_url, external_peer_username, external_peer_password,
                required_labels, platform_filter_json, gc_policies_json, metadata_json,
                in_maintenance, next_blob_sweep_at, next_storage_sweep_at,
                next_federation_announcement_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&account.name)
        .bind(&account.auth_tenant_id)
        .bind(&account.upstream_peer_hostname)
        .bind(&account.external_peer_url)
        .bind(&account.external_peer_username)
        .bind(&account.external_peer_password)
        .bind(&account.required_labels)
        .bind(&account.platform_filter_json)
        .bind(&account.gc_policies_json)
        .bind(&account.metadata_json)
        .bind(account.in_maintenance)
        .bind(account.next_blob_sweep_at)
        .bind(account.next_storage_sweep_at)
        .bind(account.next_federation_announcement_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, name: &str) -> MetadataResult<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_accounts(
        &self,
        marker: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<AccountRow>> {
        let rows = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts WHERE name > $1 ORDER BY name ASC LIMIT $2",
        )
        .bind(marker.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_account(&self, account: &AccountRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET
                auth_tenant_id = $2, upstream_peer_hostname = $3,
                external_peer_url = $4, external_peer_username = $5,
                external_peer_password = $6, required_labels = $7,
                platform_filter_json = $8, gc_policies_json = $9,
                metadata_json = $10, in_maintenance = $11
            WHERE name = $1
            "#,
        )
        .bind(&account.name)
        .bind(&account.auth_tenant_id)
        .bind(&account.upstream_peer_hostname)
        .bind(&account.external_peer_url)
        .bind(&account.external_peer_username)
        .bind(&account.external_peer_password)
        .bind(&account.required_labels)
        .bind(&account.platform_filter_json)
        .bind(&account.gc_policies_json)
        .bind(&account.metadata_json)
        .bind(account.in_maintenance)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("account {}", account.name)));
        }
        Ok(())
    }

    async fn delete_account(&self, name: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_blob_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT * FROM accounts
             WHERE next_blob_sweep_at IS NULL OR next_blob_sweep_at < $1
             ORDER BY next_blob_sweep_at IS NULL DESC, next_blob_sweep_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(account) = &row {
            sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
                .bind(&account.name)
                .bind(lease_until)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_blob_sweep_at(&self, name: &str, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next_storage_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT * FROM accounts
             WHERE next_storage_sweep_at IS NULL OR next_storage_sweep_at < $1
             ORDER BY next_storage_sweep_at IS NULL DESC, next_storage_sweep_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(account) = &row {
            sqlx::query("UPDATE accounts SET next_storage_sweep_at = $2 WHERE name = $1")
                .bind(&account.name)
                .bind(lease_until)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_storage_sweep_at(
        &self,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE accounts SET next_storage_sweep_at = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next_federation_announcement(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT * FROM accounts
             WHERE next_federation_announcement_at IS NULL
                OR next_federation_announcement_at < $1
             ORDER BY next_federation_announcement_at IS NULL DESC,
                      next_federation_announcement_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(account) = &row {
            sqlx::query(
                "UPDATE accounts SET next_federation_announcement_at = $2 WHERE name = $1",
            )
            .bind(&account.name)
            .bind(lease_until)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_federation_announcement_at(
        &self,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE accounts SET next_federation_announcement_at = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Repos
// =============================================================================

#[async_trait]
impl RepoRepo for SqliteStore {
    async fn get_or_create_repo(
        &self,
        account_name: &str,
        name: &str,
    ) -> MetadataResult<RepoRow> {
        sqlx::query("INSERT INTO repos (account_name, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(account_name)
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.get_repo(account_name, name)
            .await?
            .ok_or_else(|| MetadataError::Internal(format!("repo {account_name}/{name} vanished")))
    }

    async fn get_repo(&self, account_name: &str, name: &str) -> MetadataResult<Option<RepoRow>> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT * FROM repos WHERE account_name = $1 AND name = $2",
        )
        .bind(account_name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_repo_by_id(&self, id: i64) -> MetadataResult<Option<RepoRow>> {
        let row = sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_repos(
        &self,
        account_name: &str,
        marker: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<RepoRow>> {
        let rows = sqlx::query_as::<_, RepoRow>(
            "SELECT * FROM repos WHERE account_name = $1 AND name > $2 ORDER BY name ASC LIMIT $3",
        )
        .bind(account_name)
        .bind(marker.unwrap_or(""))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_repo(&self, id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM repos WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_blob_mount_sweep(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>> {
        let mut tx = self.pool.begin().await?;
        // Repos with a poisoned manifest are skipped: their ref lists may
        // be incomplete, and sweeping on incomplete refs deletes mounts
        // that are still needed.
        let row = sqlx::query_as::<_, RepoRow>(
            r#"
            SELECT * FROM repos
             WHERE (next_blob_mount_sweep_at IS NULL OR next_blob_mount_sweep_at < $1)
               AND id NOT IN (SELECT repo_id FROM manifests WHERE validation_error_message != '')
             ORDER BY next_blob_mount_sweep_at IS NULL DESC, next_blob_mount_sweep_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(repo) = &row {
            sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = $2 WHERE id = $1")
                .bind(repo.id)
                .bind(lease_until)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_blob_mount_sweep_at(
        &self,
        id: i64,
        at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next_gc(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RepoRow>(
            r#"
            SELECT * FROM repos
             WHERE next_gc_at IS NULL OR next_gc_at < $1
             ORDER BY next_gc_at IS NULL DESC, next_gc_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(repo) = &row {
            sqlx::query("UPDATE repos SET next_gc_at = $2 WHERE id = $1")
                .bind(repo.id)
                .bind(lease_until)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_gc_at(&self, id: i64, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET next_gc_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next_manifest_sync(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<RepoRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RepoRow>(
            r#"
            SELECT repos.* FROM repos
              JOIN accounts ON repos.account_name = accounts.name
             WHERE (repos.next_manifest_sync_at IS NULL OR repos.next_manifest_sync_at < $1)
               AND (accounts.upstream_peer_hostname != '' OR accounts.external_peer_url != '')
             ORDER BY repos.next_manifest_sync_at IS NULL DESC, repos.next_manifest_sync_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(repo) = &row {
            sqlx::query("UPDATE repos SET next_manifest_sync_at = $2 WHERE id = $1")
                .bind(repo.id)
                .bind(lease_until)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_next_manifest_sync_at(&self, id: i64, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET next_manifest_sync_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Blobs and blob mounts
// =============================================================================

#[async_trait]
impl BlobRepo for SqliteStore {
    async fn upsert_blob(&self, blob: &NewBlob) -> MetadataResult<BlobRow> {
        sqlx::query(
            r#"
            INSERT INTO blobs (account_name, digest, size_bytes, storage_id, media_type,
                               pushed_at, validated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (account_name, digest) DO NOTHING
            "#,
        )
        .bind(&blob.account_name)
        .bind(&blob.digest)
        .bind(blob.size_bytes)
        .bind(&blob.storage_id)
        .bind(&blob.media_type)
        .bind(blob.pushed_at)
        .execute(&self.pool)
        .await?;
        self.get_blob(&blob.account_name, &blob.digest)
            .await?
            .ok_or_else(|| {
                MetadataError::Internal(format!(
                    "blob {}@{} vanished",
                    blob.account_name, blob.digest
                ))
            })
    }

    async fn get_blob(
        &self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE account_name = $1 AND digest = $2",
        )
        .bind(account_name)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_blob_by_id(&self, id: i64) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>("SELECT * FROM blobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn delete_blob(&self, id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_blob_validation(
        &self,
        id: i64,
        validated_at: Option<OffsetDateTime>,
        error_message: &str,
    ) -> MetadataResult<()> {
        match validated_at {
            Some(at) => {
                sqlx::query(
                    "UPDATE blobs SET validated_at = $2, validation_error_message = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(at)
                .bind(error_message)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE blobs SET validation_error_message = $2 WHERE id = $1")
                    .bind(id)
                    .bind(error_message)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn set_blocks_vuln_scanning(&self, id: i64, blocks: bool) -> MetadataResult<()> {
        sqlx::query("UPDATE blobs SET blocks_vuln_scanning = $2 WHERE id = $1")
            .bind(id)
            .bind(blocks)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<()> {
        // Verify same-account before mounting; a cross-account mount must
        // read as "blob does not exist".
        let same_account: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM blobs
              JOIN repos ON repos.account_name = blobs.account_name
             WHERE blobs.id = $1 AND repos.id = $2
            "#,
        )
        .bind(blob_id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        if same_account.is_none() {
            return Err(MetadataError::NotFound(format!(
                "blob {blob_id} in account of repo {repo_id}"
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2)
            ON CONFLICT (blob_id, repo_id) DO UPDATE SET can_be_deleted_at = NULL
            "#,
        )
        .bind(blob_id)
        .bind(repo_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_blob_mount(
        &self,
        blob_id: i64,
        repo_id: i64,
    ) -> MetadataResult<Option<BlobMountRow>> {
        let row = sqlx::query_as::<_, BlobMountRow>(
            "SELECT * FROM blob_mounts WHERE blob_id = $1 AND repo_id = $2",
        )
        .bind(blob_id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_blob_mounts(&self, repo_id: i64) -> MetadataResult<Vec<BlobMountRow>> {
        let rows = sqlx::query_as::<_, BlobMountRow>(
            "SELECT * FROM blob_mounts WHERE repo_id = $1 ORDER BY blob_id ASC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_unreferenced_blob_mounts(
        &self,
        repo_id: i64,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE blob_mounts SET can_be_deleted_at = $2
             WHERE repo_id = $1 AND can_be_deleted_at IS NULL AND blob_id NOT IN (
                SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1
             )
            "#,
        )
        .bind(repo_id)
        .bind(can_be_deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unmark_referenced_blob_mounts(&self, repo_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE blob_mounts SET can_be_deleted_at = NULL
             WHERE repo_id = $1 AND blob_id IN (
                SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1
             )
            "#,
        )
        .bind(repo_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_marked_blob_mounts(
        &self,
        repo_id: i64,
        now: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result =
            sqlx::query("DELETE FROM blob_mounts WHERE repo_id = $1 AND can_be_deleted_at < $2")
                .bind(repo_id)
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn mark_unmounted_blobs(
        &self,
        account_name: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE blobs SET can_be_deleted_at = $2
             WHERE account_name = $1 AND can_be_deleted_at IS NULL
               AND id NOT IN (SELECT blob_id FROM blob_mounts)
            "#,
        )
        .bind(account_name)
        .bind(can_be_deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unmark_mounted_blobs(&self, account_name: &str) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE blobs SET can_be_deleted_at = NULL
             WHERE account_name = $1 AND id IN (SELECT blob_id FROM blob_mounts)
            "#,
        )
        .bind(account_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_marked_blobs(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<BlobRow>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE account_name = $1 AND can_be_deleted_at < $2",
        )
        .bind(account_name)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        for blob in &rows {
            sqlx::query("DELETE FROM blobs WHERE id = $1")
                .bind(blob.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows)
    }

    async fn list_blob_storage_ids(&self, account_name: &str) -> MetadataResult<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT storage_id FROM blobs WHERE account_name = $1")
                .bind(account_name)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn blobs_for_manifest(
        &self,
        repo_id: i64,
        manifest_digest: &str,
    ) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            r#"
            SELECT blobs.* FROM blobs
              JOIN manifest_blob_refs ON manifest_blob_refs.blob_id = blobs.id
             WHERE manifest_blob_refs.repo_id = $1 AND manifest_blob_refs.digest = $2
            "#,
        )
        .bind(repo_id)
        .bind(manifest_digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_pending_blob(&self, pending: &PendingBlobRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_blobs (account_name, digest, reason, since)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_name, digest) DO NOTHING
            "#,
        )
        .bind(&pending.account_name)
        .bind(&pending.digest)
        .bind(&pending.reason)
        .bind(pending.since)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::AlreadyExists(format!(
                "pending blob {}@{}",
                pending.account_name, pending.digest
            )));
        }
        Ok(())
    }

    async fn get_pending_blob(
        &self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<Option<PendingBlobRow>> {
        let row = sqlx::query_as::<_, PendingBlobRow>(
            "SELECT * FROM pending_blobs WHERE account_name = $1 AND digest = $2",
        )
        .bind(account_name)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_pending_blob(
        &self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<bool> {
        let result =
            sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
                .bind(account_name)
                .bind(digest)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Manifests, refs, tags
// =============================================================================

#[async_trait]
impl ManifestRepo for SqliteStore {
    async fn create_manifest(
        &self,
        manifest: &ManifestRow,
        content: &[u8],
        blob_ids: &[i64],
        child_digests: &[String],
        auth_tenant_id: &str,
        manifests_limit: i64,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM manifests WHERE repo_id = $1 AND digest = $2")
                .bind(manifest.repo_id)
                .bind(&manifest.digest)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            let used: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM manifests
                  JOIN repos ON manifests.repo_id = repos.id
                  JOIN accounts ON repos.account_name = accounts.name
                 WHERE accounts.auth_tenant_id = $1
                "#,
            )
            .bind(auth_tenant_id)
            .fetch_one(&mut *tx)
            .await?;
            if used >= manifests_limit {
                return Err(MetadataError::QuotaExceeded {
                    used,
                    limit: manifests_limit,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO manifests (
                repo_id, digest, media_type, size_bytes, pushed_at, validated_at,
                validation_error_message, last_pulled_at, next_vuln_check_at, vuln_status,
                vuln_scan_error, labels_json, gc_status_json,
                min_layer_created_at, max_layer_created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (repo_id, digest) DO UPDATE SET
                media_type = excluded.media_type,
                size_bytes = excluded.size_bytes,
                validated_at = excluded.validated_at,
                validation_error_message = '',
                labels_json = excluded.labels_json,
                min_layer_created_at = excluded.min_layer_created_at,
                max_layer_created_at = excluded.max_layer_created_at
            "#,
        )
        .bind(manifest.repo_id)
        .bind(&manifest.digest)
        .bind(&manifest.media_type)
        .bind(manifest.size_bytes)
        .bind(manifest.pushed_at)
        .bind(manifest.validated_at)
        .bind(&manifest.validation_error_message)
        .bind(manifest.last_pulled_at)
        .bind(manifest.next_vuln_check_at)
        .bind(&manifest.vuln_status)
        .bind(&manifest.vuln_scan_error)
        .bind(&manifest.labels_json)
        .bind(&manifest.gc_status_json)
        .bind(manifest.min_layer_created_at)
        .bind(manifest.max_layer_created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO manifest_contents (repo_id, digest, content) VALUES ($1, $2, $3)
            ON CONFLICT (repo_id, digest) DO UPDATE SET content = excluded.content
            "#,
        )
        .bind(manifest.repo_id)
        .bind(&manifest.digest)
        .bind(content)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2")
            .bind(manifest.repo_id)
            .bind(&manifest.digest)
            .execute(&mut *tx)
            .await?;
        for blob_id in blob_ids {
            sqlx::query(
                "INSERT INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES ($1, $2, $3)",
            )
            .bind(manifest.repo_id)
            .bind(&manifest.digest)
            .bind(blob_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2")
            .bind(manifest.repo_id)
            .bind(&manifest.digest)
            .execute(&mut *tx)
            .await?;
        for child_digest in child_digests {
            sqlx::query(
                r#"
                INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(manifest.repo_id)
            .bind(&manifest.digest)
            .bind(child_digest)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_manifest(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<ManifestRow>> {
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_manifest_content(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<Vec<u8>>> {
        let row: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT content FROM manifest_contents WHERE repo_id = $1 AND digest = $2",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_manifests(&self, repo_id: i64) -> MetadataResult<Vec<ManifestRow>> {
        let rows = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests WHERE repo_id = $1 ORDER BY digest ASC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;
        let parent_digest: Option<String> = sqlx::query_scalar(
            r#"
            SELECT parent_digest FROM manifest_manifest_refs
             WHERE repo_id = $1 AND child_digest = $2
             LIMIT 1
            "#,
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(parent_digest) = parent_digest {
            return Err(MetadataError::ManifestReferenced {
                digest: digest.to_string(),
                parent_digest,
            });
        }
        let result = sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn parent_digests(&self, repo_id: i64, digest: &str) -> MetadataResult<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT parent_digest FROM manifest_manifest_refs
             WHERE repo_id = $1 AND child_digest = $2
             ORDER BY parent_digest ASC
            "#,
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn child_refs(
        &self,
        repo_id: i64,
        parent_digest: &str,
    ) -> MetadataResult<Vec<ManifestManifestRefRow>> {
        let rows = sqlx::query_as::<_, ManifestManifestRefRow>(
            r#"
            SELECT * FROM manifest_manifest_refs
             WHERE repo_id = $1 AND parent_digest = $2
             ORDER BY child_digest ASC
            "#,
        )
        .bind(repo_id)
        .bind(parent_digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_manifest_pulled_at(
        &self,
        repo_id: i64,
        digest: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE manifests SET last_pulled_at = $3 WHERE repo_id = $1 AND digest = $2",
        )
        .bind(repo_id)
        .bind(digest)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_manifests_for_tenant(&self, auth_tenant_id: &str) -> MetadataResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM manifests
              JOIN repos ON manifests.repo_id = repos.id
              JOIN accounts ON repos.account_name = accounts.name
             WHERE accounts.auth_tenant_id = $1
            "#,
        )
        .bind(auth_tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn next_manifest_to_validate(
        &self,
        validated_before: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>> {
        let row = sqlx::query_as::<_, ManifestRow>(
            r#"
            SELECT * FROM manifests
             WHERE validated_at < $1
             ORDER BY validated_at ASC
             LIMIT 1
            "#,
        )
        .bind(validated_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_manifest_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: Option<OffsetDateTime>,
        error_message: &str,
    ) -> MetadataResult<()> {
        match validated_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE manifests SET validated_at = $3, validation_error_message = $4
                     WHERE repo_id = $1 AND digest = $2
                    "#,
                )
                .bind(repo_id)
                .bind(digest)
                .bind(at)
                .bind(error_message)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE manifests SET validation_error_message = $3
                     WHERE repo_id = $1 AND digest = $2
                    "#,
                )
                .bind(repo_id)
                .bind(digest)
                .bind(error_message)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn claim_next_vuln_check(
        &self,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ManifestRow>(
            r#"
            SELECT * FROM manifests
             WHERE next_vuln_check_at IS NULL OR next_vuln_check_at < $1
             ORDER BY next_vuln_check_at IS NULL DESC, next_vuln_check_at ASC
             LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(manifest) = &row {
            sqlx::query(
                "UPDATE manifests SET next_vuln_check_at = $3 WHERE repo_id = $1 AND digest = $2",
            )
            .bind(manifest.repo_id)
            .bind(&manifest.digest)
            .bind(lease_until)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn set_vuln_status(
        &self,
        repo_id: i64,
        digest: &str,
        status: &str,
        scan_error: &str,
        next_check_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            UPDATE manifests SET vuln_status = $3, vuln_scan_error = $4, next_vuln_check_at = $5
             WHERE repo_id = $1 AND digest = $2
            "#,
        )
        .bind(repo_id)
        .bind(digest)
        .bind(status)
        .bind(scan_error)
        .bind(next_check_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_gc_status(
        &self,
        repo_id: i64,
        digest: &str,
        gc_status_json: &str,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE manifests SET gc_status_json = $3 WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .bind(gc_status_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_tag(
        &self,
        repo_id: i64,
        name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tags (repo_id, name, digest, pushed_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (repo_id, name) DO UPDATE SET
                digest = excluded.digest, pushed_at = excluded.pushed_at
            "#,
        )
        .bind(repo_id)
        .bind(name)
        .bind(digest)
        .bind(pushed_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                MetadataError::NotFound(format!("manifest {digest} in repo {repo_id}"))
            }
            _ => MetadataError::Database(err),
        })?;
        Ok(())
    }

    async fn get_tag(&self, repo_id: i64, name: &str) -> MetadataResult<Option<TagRow>> {
        let row =
            sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE repo_id = $1 AND name = $2")
                .bind(repo_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn list_tags(&self, repo_id: i64) -> MetadataResult<Vec<TagRow>> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE repo_id = $1 ORDER BY name ASC",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn tags_for_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<Vec<TagRow>> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE repo_id = $1 AND digest = $2 ORDER BY name ASC",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_tag(&self, repo_id: i64, name: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
            .bind(repo_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_tag_pulled_at(
        &self,
        repo_id: i64,
        name: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE tags SET last_pulled_at = $3 WHERE repo_id = $1 AND name = $2")
            .bind(repo_id)
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Uploads
// =============================================================================

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (repo_id, uuid, storage_id, size_bytes, digest, num_chunks,
                                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .bind(&upload.storage_id)
        .bind(upload.size_bytes)
        .bind(&upload.digest)
        .bind(upload.num_chunks)
        .bind(upload.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload(&self, repo_id: i64, uuid: Uuid) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE repo_id = $1 AND uuid = $2",
        )
        .bind(repo_id)
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_upload(&self, upload: &UploadRow) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE uploads SET size_bytes = $3, digest = $4, num_chunks = $5, updated_at = $6
             WHERE repo_id = $1 AND uuid = $2
            "#,
        )
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .bind(upload.size_bytes)
        .bind(&upload.digest)
        .bind(upload.num_chunks)
        .bind(upload.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("upload {}", upload.uuid)));
        }
        Ok(())
    }

    async fn delete_upload(&self, repo_id: i64, uuid: Uuid) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(repo_id)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Quotas
// =============================================================================

#[async_trait]
impl QuotaRepo for SqliteStore {
    async fn get_quota(&self, auth_tenant_id: &str) -> MetadataResult<Option<QuotaRow>> {
        let row =
            sqlx::query_as::<_, QuotaRow>("SELECT * FROM quotas WHERE auth_tenant_id = $1")
                .bind(auth_tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn set_quota(&self, quota: &QuotaRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quotas (auth_tenant_id, manifests) VALUES ($1, $2)
            ON CONFLICT (auth_tenant_id) DO UPDATE SET manifests = excluded.manifests
            "#,
        )
        .bind(&quota.auth_tenant_id)
        .bind(quota.manifests)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Peers
// =============================================================================

#[async_trait]
impl PeerRepo for SqliteStore {
    async fn ensure_peer(&self, hostname: &str) -> MetadataResult<()> {
        sqlx::query("INSERT INTO peers (hostname) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(hostname)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_peer(&self, hostname: &str) -> MetadataResult<Option<PeerRow>> {
        let row = sqlx::query_as::<_, PeerRow>("SELECT * FROM peers WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_peers(&self) -> MetadataResult<Vec<PeerRow>> {
        let rows = sqlx::query_as::<_, PeerRow>("SELECT * FROM peers ORDER BY hostname ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn claim_next_peer(
        &self,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<PeerRow>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, PeerRow>(
            r#"
            SELECT * FROM peers
             WHERE last_peered_at < $1 OR last_peered_at IS NULL
             ORDER BY last_peered_at IS NULL DESC, last_peered_at ASC
             LIMIT 1
            "#,
        )
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(peer) = &row {
            sqlx::query("UPDATE peers SET last_peered_at = $2 WHERE hostname = $1")
                .bind(&peer.hostname)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(row)
    }

    async fn rotate_peer_password(
        &self,
        hostname: &str,
        new_password_hash: &str,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE peers SET
                their_previous_password_hash = their_current_password_hash,
                their_current_password_hash = $2
            WHERE hostname = $1
            "#,
        )
        .bind(hostname)
        .bind(new_password_hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("peer {hostname}")));
        }
        Ok(())
    }

    async fn set_our_password(&self, hostname: &str, password: &str) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE peers SET our_password = $2 WHERE hostname = $1")
            .bind(hostname)
            .bind(password)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("peer {hostname}")));
        }
        Ok(())
    }
}

// =============================================================================
// Storage sweep bookkeeping
// =============================================================================

#[async_trait]
impl StorageSweepRepo for SqliteStore {
    async fn upsert_unknown_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unknown_blobs (account_name, storage_id, can_be_deleted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_name, storage_id) DO NOTHING
            "#,
        )
        .bind(account_name)
        .bind(storage_id)
        .bind(can_be_deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unknown_blobs(
        &self,
        account_name: &str,
    ) -> MetadataResult<Vec<UnknownBlobRow>> {
        let rows = sqlx::query_as::<_, UnknownBlobRow>(
            "SELECT * FROM unknown_blobs WHERE account_name = $1 ORDER BY storage_id ASC",
        )
        .bind(account_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_unknown_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> MetadataResult<bool> {
        let result =
            sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2")
                .bind(account_name)
                .bind(storage_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_unknown_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        can_be_deleted_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unknown_manifests (account_name, repo_name, digest, can_be_deleted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_name, repo_name, digest) DO NOTHING
            "#,
        )
        .bind(account_name)
        .bind(repo_name)
        .bind(digest)
        .bind(can_be_deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unknown_manifests(
        &self,
        account_name: &str,
    ) -> MetadataResult<Vec<UnknownManifestRow>> {
        let rows = sqlx::query_as::<_, UnknownManifestRow>(
            r#"
            SELECT * FROM unknown_manifests
             WHERE account_name = $1
             ORDER BY repo_name ASC, digest ASC
            "#,
        )
        .bind(account_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_unknown_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM unknown_manifests
             WHERE account_name = $1 AND repo_name = $2 AND digest = $3
            "#,
        )
        .bind(account_name)
        .bind(repo_name)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_manifest_storage_keys(
        &self,
        account_name: &str,
    ) -> MetadataResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT repos.name, manifests.digest FROM manifests
              JOIN repos ON manifests.repo_id = repos.id
             WHERE repos.account_name = $1
            "#,
        )
        .bind(account_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// SQL schema for SQLite. Keep column names and FK cascade modes in sync
/// with `postgres_schema.sql`; the relational schema is the durable
/// contract of the registry.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    name                            TEXT NOT NULL PRIMARY KEY,
    auth_tenant_id                  TEXT NOT NULL,
    upstream_peer_hostname          TEXT NOT NULL DEFAULT '',
    external_peer_url               TEXT NOT NULL DEFAULT '',
    external_peer_username          TEXT NOT NULL DEFAULT '',
    external_peer_password          TEXT NOT NULL DEFAULT '',
    required_labels                 TEXT NOT NULL DEFAULT '',
    platform_filter_json            TEXT NOT NULL DEFAULT '',
    gc_policies_json                TEXT NOT NULL DEFAULT '[]',
    metadata_json                   TEXT NOT NULL DEFAULT '',
    in_maintenance                  INTEGER NOT NULL DEFAULT 0,
    next_blob_sweep_at              TEXT DEFAULT NULL,
    next_storage_sweep_at           TEXT DEFAULT NULL,
    next_federation_announcement_at TEXT DEFAULT NULL
);

CREATE TABLE IF NOT EXISTS quotas (
    auth_tenant_id TEXT    NOT NULL PRIMARY KEY,
    manifests      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS peers (
    hostname                     TEXT NOT NULL PRIMARY KEY,
    our_password                 TEXT NOT NULL DEFAULT '',
    their_current_password_hash  TEXT NOT NULL DEFAULT '',
    their_previous_password_hash TEXT NOT NULL DEFAULT '',
    last_peered_at               TEXT DEFAULT NULL
);

CREATE TABLE IF NOT EXISTS repos (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    account_name             TEXT NOT NULL REFERENCES accounts (name) ON DELETE CASCADE,
    name                     TEXT NOT NULL,
    next_blob_mount_sweep_at TEXT DEFAULT NULL,
    next_manifest_sync_at    TEXT DEFAULT NULL,
    next_gc_at               TEXT DEFAULT NULL,
    UNIQUE (account_name, name)
);

CREATE TABLE IF NOT EXISTS blobs (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    account_name             TEXT NOT NULL REFERENCES accounts (name) ON DELETE CASCADE,
    digest                   TEXT NOT NULL,
    size_bytes               INTEGER NOT NULL,
    storage_id               TEXT NOT NULL,
    media_type               TEXT NOT NULL DEFAULT '',
    pushed_at                TEXT NOT NULL,
    validated_at             TEXT NOT NULL,
    validation_error_message TEXT NOT NULL DEFAULT '',
    can_be_deleted_at        TEXT DEFAULT NULL,
    blocks_vuln_scanning     INTEGER DEFAULT NULL,
    UNIQUE (account_name, digest)
);

CREATE TABLE IF NOT EXISTS blob_mounts (
    blob_id           INTEGER NOT NULL REFERENCES blobs (id) ON DELETE CASCADE,
    repo_id           INTEGER NOT NULL REFERENCES repos (id) ON DELETE CASCADE,
    can_be_deleted_at TEXT DEFAULT NULL,
    UNIQUE (blob_id, repo_id)
);

CREATE TABLE IF NOT EXISTS uploads (
    repo_id    INTEGER NOT NULL REFERENCES repos (id) ON DELETE CASCADE,
    uuid       BLOB NOT NULL,
    storage_id TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    digest     TEXT NOT NULL DEFAULT '',
    num_chunks INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (repo_id, uuid)
);

CREATE TABLE IF NOT EXISTS manifests (
    repo_id                  INTEGER NOT NULL REFERENCES repos (id) ON DELETE CASCADE,
    digest                   TEXT NOT NULL,
    media_type               TEXT NOT NULL,
    size_bytes               INTEGER NOT NULL,
    pushed_at                TEXT NOT NULL,
    validated_at             TEXT NOT NULL,
    validation_error_message TEXT NOT NULL DEFAULT '',
    last_pulled_at           TEXT DEFAULT NULL,
    next_vuln_check_at       TEXT DEFAULT NULL,
    vuln_status              TEXT NOT NULL DEFAULT 'Pending',
    vuln_scan_error          TEXT NOT NULL DEFAULT '',
    labels_json              TEXT NOT NULL DEFAULT '',
    gc_status_json           TEXT NOT NULL DEFAULT '',
    min_layer_created_at     TEXT DEFAULT NULL,
    max_layer_created_at     TEXT DEFAULT NULL,
    PRIMARY KEY (repo_id, digest)
);

CREATE TABLE IF NOT EXISTS manifest_contents (
    repo_id INTEGER NOT NULL,
    digest  TEXT NOT NULL,
    content BLOB NOT NULL,
    UNIQUE (repo_id, digest),
    FOREIGN KEY (repo_id, digest) REFERENCES manifests (repo_id, digest) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS manifest_blob_refs (
    repo_id INTEGER NOT NULL,
    digest  TEXT NOT NULL,
    blob_id INTEGER NOT NULL,
    UNIQUE (repo_id, digest, blob_id),
    FOREIGN KEY (repo_id, digest)  REFERENCES manifests (repo_id, digest) ON DELETE CASCADE,
    FOREIGN KEY (blob_id, repo_id) REFERENCES blob_mounts (blob_id, repo_id) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS manifest_manifest_refs (
    repo_id       INTEGER NOT NULL,
    parent_digest TEXT NOT NULL,
    child_digest  TEXT NOT NULL,
    UNIQUE (repo_id, parent_digest, child_digest),
    FOREIGN KEY (repo_id, parent_digest) REFERENCES manifests (repo_id, digest) ON DELETE CASCADE,
    FOREIGN KEY (repo_id, child_digest)  REFERENCES manifests (repo_id, digest) ON DELETE RESTRICT
);

CREATE TABLE IF NOT EXISTS tags (
    repo_id        INTEGER NOT NULL,
    name           TEXT NOT NULL,
    digest         TEXT NOT NULL,
    pushed_at      TEXT NOT NULL,
    last_pulled_at TEXT DEFAULT NULL,
    PRIMARY KEY (repo_id, name),
    FOREIGN KEY (repo_id, digest) REFERENCES manifests (repo_id, digest) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS pending_blobs (
    account_name TEXT NOT NULL REFERENCES accounts (name) ON DELETE CASCADE,
    digest       TEXT NOT NULL,
    reason       TEXT NOT NULL,
    since        TEXT NOT NULL,
    PRIMARY KEY (account_name, digest)
);

CREATE TABLE IF NOT EXISTS unknown_blobs (
    account_name      TEXT NOT NULL REFERENCES accounts (name) ON DELETE CASCADE,
    storage_id        TEXT NOT NULL,
    can_be_deleted_at TEXT NOT NULL,
    PRIMARY KEY (account_name, storage_id)
);

CREATE TABLE IF NOT EXISTS unknown_manifests (
    account_name      TEXT NOT NULL REFERENCES accounts (name) ON DELETE CASCADE,
    repo_name         TEXT NOT NULL,
    digest            TEXT NOT NULL,
    can_be_deleted_at TEXT NOT NULL,
    PRIMARY KEY (account_name, repo_name, digest)
);

CREATE INDEX IF NOT EXISTS idx_repos_account ON repos (account_name);
CREATE INDEX IF NOT EXISTS idx_blobs_account ON blobs (account_name);
CREATE INDEX IF NOT EXISTS idx_blob_mounts_repo ON blob_mounts (repo_id);
CREATE INDEX IF NOT EXISTS idx_manifest_blob_refs_mount ON manifest_blob_refs (blob_id, repo_id);
CREATE INDEX IF NOT EXISTS idx_manifest_manifest_refs_child ON manifest_manifest_refs (repo_id, child_digest);
CREATE INDEX IF NOT EXISTS idx_manifests_validated_at ON manifests (validated_at);
CREATE INDEX IF NOT EXISTS idx_manifests_next_vuln_check ON manifests (next_vuln_check_at);
"#;
