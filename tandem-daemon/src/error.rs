use std::path::PathBuf;

use thiserror::Error;

use tandem_sync::{DiffError, FileError, SyncError};

/// Error surface for the transport, protocol, peers and runtime.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Core(#[from] tandem_core::CoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Recoverable: the tree changed underneath an operation.
    #[error(transparent)]
    File(#[from] FileError),

    /// The other end closed the channel (EOF or broken pipe).
    #[error("connection closed by {0}")]
    ConnectionClosed(&'static str),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("frame of {len} bytes exceeds memory ceiling of {ceiling} bytes")]
    FrameTooLarge { len: usize, ceiling: usize },

    /// Protocol desynchronization: unknown command, unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no peers left to synchronize with")]
    NoPeers,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl DaemonError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaemonError::File(_))
    }
}

impl From<DiffError> for DaemonError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::File(f) => DaemonError::File(f),
            DiffError::Fatal(SyncError::Delivery(inner)) => match inner.downcast::<DaemonError>() {
                Ok(daemon) => *daemon,
                Err(other) => DaemonError::Sync(SyncError::Delivery(other)),
            },
            DiffError::Fatal(s) => DaemonError::Sync(s),
        }
    }
}

impl From<DaemonError> for DiffError {
    /// Carry a delivery failure through the diff walk. Recoverable file errors
    /// stay recoverable; everything else aborts the walk.
    fn from(e: DaemonError) -> Self {
        match e {
            DaemonError::File(f) => DiffError::File(f),
            DaemonError::Sync(s) => DiffError::Fatal(s),
            DaemonError::Core(c) => DiffError::Fatal(SyncError::Core(c)),
            other => DiffError::Fatal(SyncError::Delivery(Box::new(other))),
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
