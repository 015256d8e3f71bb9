//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The backend cannot hand out direct-download URLs; callers must fall
    /// back to proxying the blob through `read_blob`.
    #[error("cannot generate pre-authorized URL for this backend")]
    CannotGenerateUrl,

    /// `cleanup_account` refuses while any objects remain.
    #[error("account storage not empty: found undeleted {kind} {id}")]
    AccountNotEmpty { kind: &'static str, id: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
