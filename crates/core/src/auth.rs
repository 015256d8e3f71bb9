//! The authentication capability interface.
//!
//! Auth backends are pluggable: each backend registers a named factory at
//! process start, and configuration selects one by name. The core only
//! consumes the [`AuthDriver`] trait and the [`UserIdentity`] value objects
//! it produces.

use crate::config::AppConfig;
use crate::error::{Error, RegistryError, RegistryErrorCode, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock};

/// Permissions that a [`UserIdentity`] can hold on an auth tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    CanViewAccount,
    CanPullFromAccount,
    CanPushToAccount,
    CanDeleteFromAccount,
    CanChangeAccount,
    CanViewQuotas,
    CanChangeQuotas,
    /// Global permission, not tied to any auth tenant.
    CanAdministrateKeppel,
}

/// Coarse classification of identities, used for audit events and for
/// special-casing peer replication traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserType {
    Regular,
    Anonymous,
    Peer,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Anonymous => "anonymous",
            Self::Peer => "peer",
        }
    }
}

/// An authenticated principal.
///
/// Identities are value objects: they serialize to `(type_name, payload)`
/// for embedding into tokens and are restored through the deserializer
/// registered for their type name.
pub trait UserIdentity: Send + Sync + fmt::Debug {
    fn user_name(&self) -> &str;
    fn user_type(&self) -> UserType;
    fn has_permission(&self, permission: Permission, auth_tenant_id: &str) -> bool;
    /// The type name under which this identity's deserializer is registered.
    fn type_name(&self) -> &'static str;
    fn serialize_payload(&self) -> Result<Vec<u8>>;
}

/// The anonymous identity: no name, no permissions.
#[derive(Clone, Debug, Default)]
pub struct AnonymousIdentity;

impl UserIdentity for AnonymousIdentity {
    fn user_name(&self) -> &str {
        ""
    }

    fn user_type(&self) -> UserType {
        UserType::Anonymous
    }

    fn has_permission(&self, _permission: Permission, _auth_tenant_id: &str) -> bool {
        false
    }

    fn type_name(&self) -> &'static str {
        "anonymous"
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// An authentication backend supporting multiple tenants.
#[async_trait]
pub trait AuthDriver: Send + Sync {
    /// The name under which this driver was registered.
    fn driver_name(&self) -> &'static str;

    /// Check whether the given string is a valid tenant ID for this
    /// backend. How thorough the check is (regex vs. lookup) is up to the
    /// driver.
    async fn validate_tenant_id(&self, tenant_id: &str) -> Result<()>;

    /// Authenticate by username and password. Usernames may not contain
    /// colons (clients encode credentials as `username:password`).
    async fn authenticate_user(
        &self,
        user_name: &str,
        password: &str,
    ) -> std::result::Result<Box<dyn UserIdentity>, RegistryError>;

    /// Authenticate from the credentials of an incoming request. The HTTP
    /// frontend extracts the relevant header value per the backend's
    /// convention and passes it here; `Ok(None)` selects the anonymous
    /// code path.
    async fn authenticate_user_from_credentials(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<Option<Box<dyn UserIdentity>>, RegistryError>;
}

type AuthDriverFactory = fn(&AppConfig) -> Result<Arc<dyn AuthDriver>>;
type IdentityDeserializer = fn(&[u8]) -> Result<Box<dyn UserIdentity>>;

static AUTH_DRIVER_FACTORIES: LazyLock<RwLock<HashMap<&'static str, AuthDriverFactory>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static IDENTITY_DESERIALIZERS: LazyLock<RwLock<HashMap<&'static str, IdentityDeserializer>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register an auth driver factory. Call once per driver during process
/// startup; registering the same name twice is a programming error.
pub fn register_auth_driver(name: &'static str, factory: AuthDriverFactory) {
    let mut factories = AUTH_DRIVER_FACTORIES.write().unwrap();
    if factories.insert(name, factory).is_some() {
        panic!("attempted to register multiple auth drivers with name = {name}");
    }
}

/// Instantiate the auth driver selected by configuration.
pub fn new_auth_driver(name: &str, config: &AppConfig) -> Result<Arc<dyn AuthDriver>> {
    let factories = AUTH_DRIVER_FACTORIES.read().unwrap();
    match factories.get(name) {
        Some(factory) => factory(config),
        None => Err(Error::Driver(format!("no such auth driver: {name}"))),
    }
}

/// Register a deserializer for a [`UserIdentity`] type name.
pub fn register_user_identity(type_name: &'static str, deserializer: IdentityDeserializer) {
    let mut deserializers = IDENTITY_DESERIALIZERS.write().unwrap();
    if deserializers.insert(type_name, deserializer).is_some() {
        panic!("attempted to register multiple user identity types with name = {type_name}");
    }
}

/// Restore a [`UserIdentity`] from its `(type_name, payload)` form.
pub fn deserialize_user_identity(type_name: &str, payload: &[u8]) -> Result<Box<dyn UserIdentity>> {
    if type_name == "anonymous" {
        return Ok(Box::new(AnonymousIdentity));
    }
    let deserializers = IDENTITY_DESERIALIZERS.read().unwrap();
    match deserializers.get(type_name) {
        Some(deserializer) => deserializer(payload),
        None => Err(Error::Driver(format!(
            "no such user identity type: {type_name}"
        ))),
    }
}

/// Convenience constructor for the "credentials rejected" error.
pub fn auth_denied(message: impl Into<String>) -> RegistryError {
    RegistryError::new(RegistryErrorCode::Unauthorized, message)
}
