//! Error types for the content store.
//!
//! Every fallible store operation returns [`Error`]. The variants are the
//! complete set of conditions a caller can distinguish; anything else is
//! folded into [`Error::StorageFailure`].
//!
//! | Variant | Raised by |
//! |---|---|
//! | `BlobNotFound` | CAS reads of an absent digest |
//! | `ReferenceNotFound` | index lookups |
//! | `DigestMismatch` | CAS writes and upload finalize |
//! | `SourceUnavailable` | builders, after retries are exhausted |
//! | `UnsafePath` | archive unpack |
//! | `StorageFailure` | any I/O failure |
//! | `InvalidManifest` | manifest parsing and registry PUT |
//! | `AlreadyExists` | CAS promotion onto an existing digest (informational) |

use std::io;
use std::path::PathBuf;

use crate::digest::Digest;

/// Boxed cause carried by [`Error::SourceUnavailable`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while operating on a store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The blob is not present in the CAS.
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// No index entry matches the reference.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// Computed content hash differs from the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the caller asked for.
        expected: Digest,
        /// Digest of the bytes actually received.
        actual: Digest,
    },

    /// A remote fetch failed after every retry.
    #[error("source unavailable: {origin}")]
    SourceUnavailable {
        /// URL or reference that was being fetched.
        origin: String,
        /// The last error observed.
        #[source]
        cause: BoxError,
    },

    /// An archive entry would be written outside the destination.
    #[error("unsafe path in archive: {}", .0.display())]
    UnsafePath(PathBuf),

    /// Generic I/O failure.
    #[error("{context}")]
    StorageFailure {
        /// What the store was doing.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The bytes do not form a manifest this store accepts.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The blob is already present at the expected digest.
    #[error("blob already exists: {0}")]
    AlreadyExists(Digest),

    /// A digest string failed to parse.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A reference string failed to parse.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// No upload session exists under this id.
    #[error("upload session not found: {0}")]
    UploadUnknown(String),

    /// A chunked upload did not continue where the session left off.
    #[error("upload range starts at {found}, session holds {expected} bytes")]
    InvalidRange {
        /// Current session length.
        expected: u64,
        /// Start offset the client sent.
        found: u64,
    },

    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

/// Prefix of the [`Error::InvalidManifest`] message raised when a pushed
/// manifest references a blob the store does not hold.
pub const MANIFEST_BLOB_UNKNOWN: &str = "manifest blob unknown";

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::StorageFailure`] from an I/O error and a description.
    pub fn storage(context: impl Into<String>, source: io::Error) -> Self {
        Error::StorageFailure {
            context: context.into(),
            source,
        }
    }

    /// Whether this error only reports that the blob was already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Whether a pushed manifest was rejected for naming an absent blob.
    pub fn is_manifest_blob_unknown(&self) -> bool {
        matches!(self, Error::InvalidManifest(msg) if msg.starts_with(MANIFEST_BLOB_UNKNOWN))
    }

    /// Whether this error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlobNotFound(_) | Error::ReferenceNotFound(_) | Error::UploadUnknown(_)
        )
    }
}

/// Attach a description to I/O results, producing [`Error::StorageFailure`].
pub(crate) trait IoContext<T> {
    fn storage_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn storage_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::storage(f(), source))
    }
}
