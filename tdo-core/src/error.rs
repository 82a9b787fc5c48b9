//! Error types for tdo-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{TaskIndex, TaskKey};

/// Failures of the local task store. The store file is left untouched.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store file exists but does not contain a valid store document.
    #[error("failed to parse task store at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error on save.
    #[error("task store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process kept the environment lock for longer than the wait budget.
    #[error("timed out after {waited:?} waiting for the store lock at {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The addressed task does not exist (or is pending deletion).
    #[error("no task with {0}")]
    UnknownTask(TaskKey),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A command's selector matched nothing; the store was not written.
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// A selector resolved to nothing. Reported to the user, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("no task with index {}", join_indices(.0))]
    UnknownIndex(Vec<TaskIndex>),

    #[error("no tasks match the filter")]
    NoMatch,
}

/// `undo` could not run.
#[derive(Debug, Error)]
pub enum UndoError {
    #[error("nothing to undo")]
    NothingToUndo,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration file failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}; run `tdo config init` first")]
    NotFound { path: PathBuf },

    #[error("config already exists at {path}; pass --force to overwrite")]
    AlreadyExists { path: PathBuf },

    #[error("invalid environment name '{0}'; use letters, digits, '-' or '_'")]
    InvalidEnv(String),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

fn join_indices(indices: &[TaskIndex]) -> String {
    indices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
