//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("manifest quota exceeded: already using {used} of {limit} manifests for this auth tenant")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("manifest {digest} is still referenced by manifest {parent_digest}")]
    ManifestReferenced { digest: String, parent_digest: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether retrying the operation later could succeed. Used by the
    /// janitor to distinguish reschedule-with-backoff from wrap-and-log.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => !matches!(err, sqlx::Error::RowNotFound),
            _ => false,
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_message() {
        let err = MetadataError::QuotaExceeded { used: 10, limit: 10 };
        assert!(err.to_string().contains("already using 10 of 10"));
    }

    #[test]
    fn test_manifest_referenced_message() {
        let err = MetadataError::ManifestReferenced {
            digest: "sha256:child".into(),
            parent_digest: "sha256:parent".into(),
        };
        assert!(err.to_string().contains("sha256:child"));
        assert!(err.to_string().contains("sha256:parent"));
    }
}
