//! The federation capability interface.
//!
//! Account names are globally unique across a federation of peer Keppel
//! instances. The federation driver arbitrates name claims and receives
//! periodic inventory announcements from the janitor.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};
use time::OffsetDateTime;

/// Outcome of a name claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimResult {
    Granted,
    /// The name belongs to someone else; the message explains to whom.
    Denied(String),
}

/// Inventory summary announced for an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountAnnouncement {
    pub name: String,
    pub auth_tenant_id: String,
    /// Hostname of the primary instance, empty for primary accounts.
    pub upstream_peer_hostname: String,
    pub in_maintenance: bool,
    pub observed_at: OffsetDateTime,
}

/// Arbitration of globally unique account names.
#[async_trait]
pub trait FederationDriver: Send + Sync {
    /// Claim an account name for the given auth tenant. A sublease token
    /// (issued by the primary instance) authorizes replica claims.
    async fn claim_account_name(
        &self,
        account_name: &str,
        auth_tenant_id: &str,
        sublease_token: Option<&str>,
    ) -> Result<ClaimResult>;

    /// Issue a token that authorizes one replica claim of this account's
    /// name on another instance.
    async fn issue_sublease_token(&self, account_name: &str) -> Result<String>;

    /// Announce the current state of a local account to the federation.
    async fn announce_account(&self, announcement: &AccountAnnouncement) -> Result<()>;

    /// Give up the claim on an account name after account deletion.
    async fn forfeit_account_name(&self, account_name: &str) -> Result<()>;
}

/// Federation driver for standalone deployments: every claim is granted
/// and announcements go nowhere.
#[derive(Debug, Default)]
pub struct TrivialFederationDriver;

#[async_trait]
impl FederationDriver for TrivialFederationDriver {
    async fn claim_account_name(
        &self,
        _account_name: &str,
        _auth_tenant_id: &str,
        _sublease_token: Option<&str>,
    ) -> Result<ClaimResult> {
        Ok(ClaimResult::Granted)
    }

    async fn issue_sublease_token(&self, _account_name: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn announce_account(&self, announcement: &AccountAnnouncement) -> Result<()> {
        tracing::debug!(account = %announcement.name, "trivial federation: announcement dropped");
        Ok(())
    }

    async fn forfeit_account_name(&self, _account_name: &str) -> Result<()> {
        Ok(())
    }
}

type FederationDriverFactory = fn(&AppConfig) -> Result<Arc<dyn FederationDriver>>;

static FEDERATION_DRIVER_FACTORIES: LazyLock<
    RwLock<HashMap<&'static str, FederationDriverFactory>>,
> = LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a federation driver factory. Call once per driver at startup.
pub fn register_federation_driver(name: &'static str, factory: FederationDriverFactory) {
    let mut factories = FEDERATION_DRIVER_FACTORIES.write().unwrap();
    if factories.insert(name, factory).is_some() {
        panic!("attempted to register multiple federation drivers with name = {name}");
    }
}

/// Instantiate the federation driver selected by configuration. The
/// "trivial" driver is always available.
pub fn new_federation_driver(name: &str, config: &AppConfig) -> Result<Arc<dyn FederationDriver>> {
    if name == "trivial" {
        return Ok(Arc::new(TrivialFederationDriver));
    }
    let factories = FEDERATION_DRIVER_FACTORIES.read().unwrap();
    match factories.get(name) {
        Some(factory) => factory(config),
        None => Err(Error::Driver(format!("no such federation driver: {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trivial_driver_grants_everything() {
        let driver = TrivialFederationDriver;
        let result = driver
            .claim_account_name("test1", "tenant1", None)
            .await
            .unwrap();
        assert_eq!(result, ClaimResult::Granted);
        driver.forfeit_account_name("test1").await.unwrap();
    }
}
