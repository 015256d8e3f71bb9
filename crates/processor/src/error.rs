//! Processor error classification.

use keppel_core::{RegistryError, RegistryErrorCode};
use keppel_metadata::MetadataError;
use keppel_storage::StorageError;
use thiserror::Error;

/// Errors returned by processor operations.
///
/// `Registry` carries a client-caused error with an OCI error code; the
/// other variants are infrastructure failures that an API frontend maps
/// to 5xx and the janitor treats as transient.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProcessorError {
    /// The OCI error code for client-visible errors; `None` for
    /// infrastructure failures (5xx territory).
    pub fn registry_code(&self) -> Option<RegistryErrorCode> {
        match self {
            Self::Registry(err) => Some(err.code),
            Self::Metadata(MetadataError::QuotaExceeded { .. }) => {
                Some(RegistryErrorCode::QuotaExceeded)
            }
            Self::Metadata(MetadataError::ManifestReferenced { .. }) => {
                Some(RegistryErrorCode::ManifestReferenced)
            }
            Self::Metadata(MetadataError::NotFound(_)) => Some(RegistryErrorCode::NameUnknown),
            _ => None,
        }
    }

    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Registry(_) => false,
            Self::Metadata(err) => err.is_transient(),
            Self::Storage(err) => !matches!(err, StorageError::NotFound(_)),
            Self::Upstream(_) => true,
        }
    }
}

impl From<keppel_core::Error> for ProcessorError {
    fn from(err: keppel_core::Error) -> Self {
        Self::Registry(RegistryError::from(err))
    }
}

/// Result type for processor operations.
pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

/// Shorthand constructor for `Registry` errors.
pub fn registry_error(code: RegistryErrorCode, message: impl Into<String>) -> ProcessorError {
    ProcessorError::Registry(RegistryError::new(code, message))
}
