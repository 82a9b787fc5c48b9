//! Error types for tdo-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tdo_core::error::StoreError;
use tdo_core::TaskUid;

/// Failures talking to the remote collection. All of them are recoverable
/// per task during push; during pull any of them aborts the batch.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("cannot decode {path}: {message}")]
    Codec { path: PathBuf, message: String },

    /// The record is not (or no longer) in the collection.
    #[error("no remote task with uid {0}")]
    NotFound(TaskUid),

    /// The record changed on the remote since it was last pulled.
    #[error("remote task {0} changed since the last pull; pull and retry")]
    PreconditionFailed(TaskUid),

    /// The call did not finish within the configured timeout.
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    /// The collection itself cannot be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

/// Why one pending operation did not go through. Recorded per task; the
/// rest of the push carries on.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The worker running the remote call panicked or was cancelled.
    #[error("push worker failed: {0}")]
    Worker(String),

    /// The remote accepted the change but the store could not record it.
    /// The operation stays pending and is sent again next time.
    #[error("remote accepted the change but the store could not record it: {0}")]
    Confirm(#[from] StoreError),
}

impl PushError {
    /// The remote-side cause, if that is where it failed.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            PushError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

/// Batch-level failures of pull, push and sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local store could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Listing the remote failed; nothing was changed locally.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A worker task panicked or was cancelled.
    #[error("sync worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience constructor for [`RemoteError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RemoteError {
    RemoteError::Io {
        path: path.into(),
        source,
    }
}
