//! Error types for tandem-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from repository, probing, and config operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another engine instance holds the repository lock.
    #[error("another tandem instance is already running for {path}")]
    Locked { path: PathBuf },

    /// No `.tandem` directory in the working directory or any ancestor.
    #[error("no tandem repository found at or above {start}")]
    RepositoryNotFound { start: PathBuf },

    /// A shadow entry file could not be decoded.
    #[error("corrupt shadow entry at {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    /// Malformed or incomplete client configuration.
    #[error("config error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// A relative path escaped the tree or was otherwise unusable.
    #[error("invalid relative path '{0}'")]
    InvalidPath(String),
}

/// Convenience constructor for [`CoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn config_err(path: impl Into<PathBuf>, message: impl Into<String>) -> CoreError {
    CoreError::Config {
        path: path.into(),
        message: message.into(),
    }
}
