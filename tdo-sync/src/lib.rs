//! # tdo-sync
//!
//! Remote collection access and the pull / push / sync pipeline.
//!
//! Call [`pull`] to mirror the remote into a [`tdo_core::Store`], [`push`] to
//! send pending local changes, or [`sync`] for both. Remotes implement
//! [`RemoteClient`]; [`VdirRemote`] is the directory-backed one.

pub mod error;
pub mod ics;
pub mod pipeline;
pub mod remote;
pub mod vdir;

pub use error::{PushError, RemoteError, SyncError};
pub use pipeline::{pull, push, sync, PullReport, PushFailure, PushReport, SyncOptions, SyncReport};
pub use remote::{PutReceipt, RemoteClient, RemoteTaskRecord, SourceLine};
pub use vdir::VdirRemote;
