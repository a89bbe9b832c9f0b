//! Interface to the remote registry.
//!
//! [`crate::http::Client`] implements it for the Docker Registry HTTP API V2.

use std::{fmt, io::Read};

use crate::digest::Digest;

/// Operations needed to pull images from a registry.
pub trait Registry: Sync {
    /// Check that the endpoint speaks the registry protocol.
    ///
    /// Return `true` if the response positively confirms it.
    fn ping(&self) -> Result<bool, RegistryError> {
        Ok(false)
    }

    /// List all tags of `repository`.
    fn tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;

    /// Get a manifest by tag or digest.
    ///
    /// Returns the `Content-Type` sent by the registry, and the body.
    fn manifest(
        &self,
        repository: &str,
        tag_or_digest: &str,
    ) -> Result<(String, Vec<u8>), RegistryError>;

    /// Open a blob, starting at `offset`.
    ///
    /// The registry can ignore the offset. The returned [`BlobReader`]
    /// indicates where its data starts.
    fn blob(&self, repository: &str, digest: &Digest, offset: u64)
        -> Result<BlobReader, RegistryError>;
}

/// Stream with the contents of a blob.
pub struct BlobReader {
    pub body: Box<dyn Read + Send>,

    /// Position of the first byte of `body` in the blob.
    pub start: u64,

    /// Size of the full blob, if the registry sent it.
    pub total: Option<u64>,
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("start", &self.start)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Error codes from the registry API.
///
/// See <https://distribution.github.io/distribution/spec/api/#errors>.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Denied,
    Unsupported,
    ManifestUnknown,
    NameUnknown,
    BlobUnknown,
    TooManyRequests,
    Other(String),
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "DENIED" => ErrorCode::Denied,
            "UNSUPPORTED" => ErrorCode::Unsupported,
            "MANIFEST_UNKNOWN" => ErrorCode::ManifestUnknown,
            "NAME_UNKNOWN" => ErrorCode::NameUnknown,
            "BLOB_UNKNOWN" => ErrorCode::BlobUnknown,
            "TOOMANYREQUESTS" => ErrorCode::TooManyRequests,
            other => ErrorCode::Other(other.to_owned()),
        }
    }
}

impl<'de> serde::Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from(code.as_str()))
    }
}

/// Entry of the `errors` list in the body of a failed response.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,

    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            ErrorCode::Other(code) => write!(f, "{code}: {}", self.message),
            code => write!(f, "{code:?}: {}", self.message),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("{url} returned {status}{}", format_details(.errors))]
    Status {
        status: u16,
        url: String,
        errors: Vec<ErrorDetail>,
    },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No basic auth credentials.")]
    MissingCredentials,

    #[error("Missing authentication tokens.")]
    MissingTokens,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing Content-Type in the response from {0}.")]
    MissingContentType(String),

    #[error("Requested range is not satisfiable.")]
    RangeNotSatisfiable,
}

fn format_details(errors: &[ErrorDetail]) -> String {
    errors.iter().fold(String::new(), |mut s, e| {
        s.push_str(if s.is_empty() { ": " } else { "; " });
        s.push_str(&e.to_string());
        s
    })
}

impl RegistryError {
    /// First error code in the response body, if any.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            RegistryError::Status { errors, .. } => errors.first().map(|e| &e.code),
            _ => None,
        }
    }

    /// `true` if the error is consistent with a registry that only
    /// supports an older protocol.
    pub fn should_fallback(&self) -> bool {
        if let RegistryError::MissingCredentials = self {
            return true;
        }

        matches!(
            self.code(),
            Some(ErrorCode::Unauthorized | ErrorCode::ManifestUnknown | ErrorCode::NameUnknown)
        )
    }

    /// `true` if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Status { status, .. } => {
                let denied = matches!(
                    self.code(),
                    Some(ErrorCode::Unauthorized | ErrorCode::Denied | ErrorCode::Unsupported)
                );

                !denied && (*status == 429 || *status >= 500)
            }

            RegistryError::Transport(_) | RegistryError::Io(_) => true,

            RegistryError::MissingCredentials
            | RegistryError::MissingTokens
            | RegistryError::Json(_)
            | RegistryError::MissingContentType(_)
            | RegistryError::RangeNotSatisfiable => false,
        }
    }
}

#[test]
fn parse_error_body() {
    #[derive(serde::Deserialize)]
    struct Body {
        errors: Vec<ErrorDetail>,
    }

    let body: Body = serde_json::from_str(
        r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown","detail":{}}]}"#,
    )
    .unwrap();

    let err = RegistryError::Status {
        status: 404,
        url: "http://example.com/v2/foo/manifests/1".into(),
        errors: body.errors,
    };

    assert_eq!(err.code(), Some(&ErrorCode::ManifestUnknown));
    assert!(err.should_fallback());
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("manifest unknown"));
}

#[test]
fn classify_retryable_errors() {
    let status = |status, code: &str| RegistryError::Status {
        status,
        url: String::new(),
        errors: vec![ErrorDetail {
            code: ErrorCode::from(code),
            message: String::new(),
        }],
    };

    assert!(status(503, "UNAVAILABLE").is_retryable());
    assert!(status(429, "TOOMANYREQUESTS").is_retryable());
    assert!(!status(401, "UNAUTHORIZED").is_retryable());
    assert!(!status(404, "BLOB_UNKNOWN").is_retryable());
    assert!(RegistryError::Transport("reset".into()).is_retryable());
    assert!(!RegistryError::MissingCredentials.is_retryable());
}
