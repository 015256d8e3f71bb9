//! Metadata store abstraction and implementations for Keppel.
//!
//! This crate provides the control-plane data model:
//! - Accounts, repositories, manifests, blobs, and the join tables that
//!   tie them together (blob mounts, manifest refs, tags)
//! - Chunked upload tracking
//! - Quotas and peering credentials
//! - Scheduler timestamps and claims for the janitor sweeps
//! - Storage-reconciliation tombstones

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use store::{MetadataStore, SqliteStore};

use keppel_core::config::DatabaseConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &DatabaseConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        DatabaseConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        DatabaseConfig::Postgres {
            url,
            max_connections,
            statement_timeout_ms,
        } => {
            tracing::info!("connecting to PostgreSQL");
            let store = PostgresStore::new(url, *max_connections, *statement_timeout_ms).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("keppel.db");
        let config = DatabaseConfig::Sqlite {
            path: db_path.clone(),
        };

        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
