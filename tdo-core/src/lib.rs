//! tdo core library: domain types, diffs, the local task store, the journal.
//!
//! Public API surface:
//! - [`types`]: newtypes and task structs
//! - [`diff`]: [`TaskDiff`] / [`TaskSetDiff`] and conflict notices
//! - [`request`]: parsed mutation requests and selectors
//! - [`tables`] / [`store`]: the mirror, pending and tombstone tables and
//!   their locked on-disk home
//! - [`journal`]: the transaction log behind `undo`
//! - [`env`]: per-environment config and paths
//! - [`error`]: error enums

pub mod diff;
pub mod env;
pub mod error;
pub mod journal;
pub mod request;
pub mod store;
pub mod tables;
pub mod types;

pub use diff::{
    Change, ConflictKind, ConflictNotice, Field, FieldState, TaskChange, TaskDiff, TaskSetDiff,
    TaskSetEntry, Value,
};
pub use env::{EnvConfig, RemoteConfig};
pub use error::{ConfigError, SelectorError, StoreError, UndoError};
pub use journal::{Journal, JournalEntry};
pub use request::{EditRequest, FieldEdit, MutationRequest, Selector, TaskFilter};
pub use store::Store;
pub use tables::{PushOp, ReconcileOutcome, Tables, TombstoneOrigin};
pub use types::{
    Attachment, EnvName, Priority, ReservedProperty, Status, Task, TaskFields, TaskIndex, TaskKey,
    TaskRef, TaskUid, XProperties,
};
