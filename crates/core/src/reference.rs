//! Validation of account names, repository names, and manifest references.

use crate::digest::Digest;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Maximum length of an account name.
pub const MAX_ACCOUNT_NAME_LEN: usize = 48;

/// Maximum length of a repository name (including the path separators).
pub const MAX_REPOSITORY_NAME_LEN: usize = 256;

/// Maximum length of a tag name, per the OCI Distribution spec.
pub const MAX_TAG_NAME_LEN: usize = 128;

static REPO_COMPONENT_RX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").unwrap());

static TAG_NAME_RX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]*$").unwrap());

/// Check an account name: lowercase letters, digits and dashes, at most 48
/// characters. Account names appear as the first path element of image
/// references and as storage path components, hence the restrictive charset.
pub fn validate_account_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_ACCOUNT_NAME_LEN {
        return Err(Error::InvalidAccountName(name.to_string()));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(Error::InvalidAccountName(name.to_string()));
    }
    Ok(())
}

/// Check a repository name (the part after the account): slash-separated
/// path components, each matching `[a-z0-9]+(?:[._-][a-z0-9]+)*`.
pub fn validate_repository_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_REPOSITORY_NAME_LEN {
        return Err(Error::InvalidRepositoryName(name.to_string()));
    }
    for component in name.split('/') {
        if !REPO_COMPONENT_RX.is_match(component) {
            return Err(Error::InvalidRepositoryName(name.to_string()));
        }
    }
    Ok(())
}

/// Check a tag name.
pub fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TAG_NAME_LEN || !TAG_NAME_RX.is_match(name) {
        return Err(Error::InvalidReference(format!("invalid tag name: {name}")));
    }
    Ok(())
}

/// A manifest reference as it appears in pull/push/delete requests:
/// either a tag name or a digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestReference {
    Tag(String),
    Digest(Digest),
}

impl ManifestReference {
    /// Parse a reference. Anything that contains a `:` must be a wellformed
    /// digest; everything else is validated as a tag name.
    pub fn parse(input: &str) -> Result<Self> {
        if input.contains(':') {
            Ok(Self::Digest(Digest::parse(input)?))
        } else {
            validate_tag_name(input)?;
            Ok(Self::Tag(input.to_string()))
        }
    }

    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Self::Digest(d) => Some(d),
            Self::Tag(_) => None,
        }
    }

    pub fn as_tag(&self) -> Option<&str> {
        match self {
            Self::Tag(t) => Some(t),
            Self::Digest(_) => None,
        }
    }
}

impl FromStr for ManifestReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ManifestReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(t) => f.write_str(t),
            Self::Digest(d) => write!(f, "{d}"),
        }
    }
}

/// The account-scoped identity that the storage driver needs to address
/// objects: tenant and account name form the path prefix for all of the
/// account's objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountScope {
    pub name: String,
    pub auth_tenant_id: String,
}

impl AccountScope {
    pub fn new(name: impl Into<String>, auth_tenant_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            auth_tenant_id: auth_tenant_id.into(),
        }
    }
}
