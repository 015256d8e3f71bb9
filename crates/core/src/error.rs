//! Error types for the core domain.

use serde::Serialize;
use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid account name: {0}")]
    InvalidAccountName(String),

    #[error("invalid repository name: {0}")]
    InvalidRepositoryName(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("invalid GC policy: {0}")]
    InvalidGcPolicy(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes defined by the OCI Distribution API, plus the Keppel-specific
/// additions for quota and reference conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestInvalid,
    ManifestUnknown,
    ManifestReferenced,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    TooManyRequests,
    QuotaExceeded,
}

impl RegistryErrorCode {
    /// The wire representation used in OCI error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlobUnknown => "BLOB_UNKNOWN",
            Self::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            Self::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            Self::DigestInvalid => "DIGEST_INVALID",
            Self::ManifestInvalid => "MANIFEST_INVALID",
            Self::ManifestUnknown => "MANIFEST_UNKNOWN",
            Self::ManifestReferenced => "MANIFEST_REFERENCED",
            Self::NameInvalid => "NAME_INVALID",
            Self::NameUnknown => "NAME_UNKNOWN",
            Self::SizeInvalid => "SIZE_INVALID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Denied => "DENIED",
            Self::Unsupported => "UNSUPPORTED",
            Self::TooManyRequests => "TOOMANYREQUESTS",
            Self::QuotaExceeded => "DENIED",
        }
    }

    /// The HTTP status code that an API frontend shall use for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BlobUnknown
            | Self::BlobUploadUnknown
            | Self::ManifestUnknown
            | Self::NameUnknown => 404,
            Self::BlobUploadInvalid
            | Self::DigestInvalid
            | Self::ManifestInvalid
            | Self::NameInvalid
            | Self::SizeInvalid => 400,
            Self::ManifestReferenced | Self::QuotaExceeded => 409,
            Self::Unauthorized => 401,
            Self::Denied => 403,
            Self::Unsupported => 415,
            Self::TooManyRequests => 429,
        }
    }
}

impl std::fmt::Display for RegistryErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified registry error, carrying the OCI error code that an API
/// frontend translates into an HTTP response.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct RegistryError {
    pub code: RegistryErrorCode,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl RegistryError {
    pub fn new(code: RegistryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<Error> for RegistryError {
    fn from(err: Error) -> Self {
        let code = match err {
            Error::InvalidDigest(_) => RegistryErrorCode::DigestInvalid,
            Error::InvalidAccountName(_) | Error::InvalidRepositoryName(_) => {
                RegistryErrorCode::NameInvalid
            }
            Error::InvalidReference(_) | Error::ManifestParse(_) => {
                RegistryErrorCode::ManifestInvalid
            }
            _ => RegistryErrorCode::Unsupported,
        };
        RegistryError::new(code, err.to_string())
    }
}

/// The OCI error payload format: `{"errors":[{code, message, detail?}]}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<WireError>,
}

#[derive(Debug, Serialize)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl From<&RegistryError> for ErrorEnvelope {
    fn from(err: &RegistryError) -> Self {
        ErrorEnvelope {
            errors: vec![WireError {
                code: err.code.as_str(),
                message: err.message.clone(),
                detail: err.detail.clone(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let err = RegistryError::new(RegistryErrorCode::ManifestUnknown, "no such manifest");
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["errors"][0]["code"], "MANIFEST_UNKNOWN");
        assert_eq!(json["errors"][0]["message"], "no such manifest");
        assert!(json["errors"][0].get("detail").is_none());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(RegistryErrorCode::BlobUnknown.http_status(), 404);
        assert_eq!(RegistryErrorCode::ManifestReferenced.http_status(), 409);
        assert_eq!(RegistryErrorCode::TooManyRequests.http_status(), 429);
    }
}
