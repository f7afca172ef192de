//! The error enum returned at every component boundary.
//!
//! Errors are surfaced once at the boundary with single-level causation;
//! internal helpers map into these kinds instead of wrapping chains.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuarryError {
    /// Requested upload/entry/path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks read/write/admin/embargo rights.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Invalid path, embargo value or metadata field for the caller.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The compare-and-set on the process status failed.
    #[error("the upload is already being processed")]
    ProcessAlreadyRunning,

    /// A parser threw or exited; the entry fails, the upload progresses.
    #[error("parser '{parser}' failed: {message}")]
    ParserFailure { parser: String, message: String },

    /// Same disposition as parser failures.
    #[error("normalizer '{normalizer}' failed: {message}")]
    NormalizerFailure {
        normalizer: String,
        message: String,
    },

    /// The entry archive could not be fully written.
    #[error("archive write failed: {0}")]
    ArchiveWriteFailure(String),

    /// Packing staging files into the public area failed; the frozen
    /// sentinel stays so retries go through repack.
    #[error("pack failed: {0}")]
    PackFailure(String),

    /// A sanity check failed while importing an upload bundle.
    #[error("bundle import failed: {0}")]
    BundleImportFailure(String),

    /// The search index rejected a write; logged and retried at the next
    /// refresh barrier, never fatal to processing.
    #[error("search index failure: {0}")]
    SearchIndexFailure(String),

    /// The state store misbehaved.
    #[error("state store failure: {0}")]
    Storage(String),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl QuarryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn unauthorized(why: impl Into<String>) -> Self {
        Self::Unauthorized(why.into())
    }

    pub fn bad_request(why: impl Into<String>) -> Self {
        Self::BadRequest(why.into())
    }

    /// True for the error kinds a caller can fix and retry (4xx-shaped).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QuarryError::NotFound(_)
                | QuarryError::Unauthorized(_)
                | QuarryError::BadRequest(_)
                | QuarryError::ProcessAlreadyRunning
        )
    }
}

impl From<crate::paths::PathError> for QuarryError {
    fn from(err: crate::paths::PathError) -> Self {
        QuarryError::BadRequest(err.to_string())
    }
}

impl From<crate::ids::IdError> for QuarryError {
    fn from(err: crate::ids::IdError) -> Self {
        QuarryError::BadRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuarryError>;
