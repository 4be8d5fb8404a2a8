//! Distribution error envelope.
//!
//! Store errors become `{"errors":[{"code","message","detail"}]}` bodies with
//! the status code a registry client expects. Server-side failures are logged
//! here so handlers can simply propagate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Errors returned by registry handlers.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An error from the content store.
    #[error(transparent)]
    Store(#[from] hauler::Error),

    /// The repository name does not parse.
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// The repository or route is unknown.
    #[error("name unknown: {0}")]
    NameUnknown(String),

    /// A `Content-Range` header could not be parsed.
    #[error("invalid range: {0}")]
    RangeInvalid(String),

    /// The server was started read-only.
    #[error("registry is read-only")]
    ReadOnly,

    /// The operation is not implemented by this registry.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A header could not be built or the request body could not be read.
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorInfo>,
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RegistryError {
    /// HTTP status and distribution error code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        use hauler::Error as E;
        match self {
            Self::Store(err) => match err {
                E::BlobNotFound(_) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
                E::ReferenceNotFound(_) => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
                E::UploadUnknown(_) => (StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN"),
                E::DigestMismatch { .. } | E::InvalidDigest(_) => {
                    (StatusCode::BAD_REQUEST, "DIGEST_INVALID")
                }
                e if e.is_manifest_blob_unknown() => {
                    (StatusCode::BAD_REQUEST, "MANIFEST_BLOB_UNKNOWN")
                }
                E::InvalidManifest(_) => (StatusCode::BAD_REQUEST, "MANIFEST_INVALID"),
                E::InvalidReference(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
                E::InvalidRange { .. } => (StatusCode::RANGE_NOT_SATISFIABLE, "RANGE_INVALID"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
            },
            Self::NameInvalid(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            Self::NameUnknown(_) => (StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
            Self::RangeInvalid(_) => (StatusCode::RANGE_NOT_SATISFIABLE, "RANGE_INVALID"),
            Self::ReadOnly => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED"),
            Self::Unsupported(_) => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN"),
        }
    }

    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            Self::Store(hauler::Error::DigestMismatch { expected, actual }) => Some(
                serde_json::json!({ "expected": expected.to_string(), "actual": actual.to_string() }),
            ),
            Self::Store(hauler::Error::InvalidRange { expected, found }) => {
                Some(serde_json::json!({ "offset": expected, "start": found }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "registry request failed");
        } else {
            tracing::debug!(error = %self, code, "registry request rejected");
        }
        let body = ErrorEnvelope {
            errors: vec![ErrorInfo {
                code,
                message: self.to_string(),
                detail: self.detail(),
            }],
        };
        (status, Json(body)).into_response()
    }
}
