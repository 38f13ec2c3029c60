//! Error types for tandem-sync.
//!
//! [`FileError`] is recoverable: the tree changed under the walker and the
//! diff should simply be retried. [`SyncError`] is fatal to the operation or
//! connection. [`DiffError`] joins the two for diff computation so callers
//! can match on the distinction.

use std::path::PathBuf;

use thiserror::Error;

use tandem_core::CoreError;

/// Transient per-file conditions.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("file vanished during diff: {path}")]
    Vanished { path: String },

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("size of {path} changed while reading (stat {expected}, read {actual})")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

/// Fatal sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed stream or payload: the two sides are out of step.
    #[error("protocol contract violated: {0}")]
    Contract(String),

    #[error("diff buffer would exceed memory ceiling of {ceiling} bytes")]
    CeilingExceeded { ceiling: usize },

    /// The sink could not deliver a flushed diff to its peers.
    #[error("diff delivery failed: {0}")]
    Delivery(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Outcome of a failed diff computation.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Fatal(#[from] SyncError),
}

impl DiffError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DiffError::File(_))
    }
}

impl From<CoreError> for DiffError {
    fn from(e: CoreError) -> Self {
        DiffError::Fatal(SyncError::Core(e))
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn contract(msg: impl Into<String>) -> SyncError {
    SyncError::Contract(msg.into())
}
