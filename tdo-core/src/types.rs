//! Domain types for the tdo task mirror.
//!
//! A [`Task`] is an identity ([`TaskIndex`] plus an optional [`TaskUid`]) and a
//! bag of [`TaskFields`]. Remote property names the model understands are
//! enumerated by [`ReservedProperty`]; everything else is carried verbatim in
//! [`XProperties`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Small user-facing task handle, stable until compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIndex(pub u32);

impl fmt::Display for TaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for TaskIndex {
    fn from(n: u32) -> Self {
        Self(n)
    }
}

impl FromStr for TaskIndex {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

/// Opaque remote identifier of a task record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUid(pub String);

impl fmt::Display for TaskUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TaskUid {
    /// Fresh client-side uid for a task that has not reached the remote yet.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<String> for TaskUid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskUid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Name of a configured environment (one remote account / collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvName(pub String);

impl EnvName {
    /// Environment used when neither `--env` nor `TDO_ENV` is given.
    pub const DEFAULT: &'static str = "default";

    /// Environment names end up in file names, so only `[A-Za-z0-9_-]` is allowed.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for EnvName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_owned())
    }
}

impl fmt::Display for EnvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EnvName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EnvName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// VTODO completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    #[serde(rename = "NEEDS-ACTION")]
    NeedsAction,
    #[serde(rename = "IN-PROCESS")]
    InProcess,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl Status {
    /// Wire name as used in the `STATUS` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NeedsAction => "NEEDS-ACTION",
            Status::InProcess => "IN-PROCESS",
            Status::Completed => "COMPLETED",
            Status::Cancelled => "CANCELLED",
        }
    }

    /// Closed tasks are hidden from the default listing.
    pub fn is_closed(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "needs-action" | "pending" | "todo" => Ok(Status::NeedsAction),
            "in-process" | "in-progress" | "started" => Ok(Status::InProcess),
            "completed" | "done" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!(
                "unknown status '{other}'; expected: needs-action, in-process, completed, cancelled"
            )),
        }
    }
}

/// Task priority. Ordering is `None < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Priority {
    /// RFC 5545 `PRIORITY` value: 1 is highest, 9 lowest, 0 undefined.
    pub fn to_ical(self) -> u8 {
        match self {
            Priority::None => 0,
            Priority::High => 1,
            Priority::Medium => 5,
            Priority::Low => 9,
        }
    }

    pub fn from_ical(value: u8) -> Self {
        match value {
            1..=4 => Priority::High,
            5 => Priority::Medium,
            6..=9 => Priority::Low,
            _ => Priority::None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::None => "-",
            Priority::Low => "L",
            Priority::Medium => "M",
            Priority::High => "H",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h" | "high" => Ok(Priority::High),
            "m" | "medium" => Ok(Priority::Medium),
            "l" | "low" => Ok(Priority::Low),
            "" | "-" | "none" => Ok(Priority::None),
            other => Err(format!("unknown priority '{other}'; expected: H, M, L or -")),
        }
    }
}

/// Remote property names that map onto [`TaskFields`] members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedProperty {
    Uid,
    Summary,
    Status,
    Priority,
    Due,
    /// `DTSTART` carries the wait instant.
    Wait,
    Categories,
    Attach,
    Project,
}

impl ReservedProperty {
    pub const ALL: [ReservedProperty; 9] = [
        ReservedProperty::Uid,
        ReservedProperty::Summary,
        ReservedProperty::Status,
        ReservedProperty::Priority,
        ReservedProperty::Due,
        ReservedProperty::Wait,
        ReservedProperty::Categories,
        ReservedProperty::Attach,
        ReservedProperty::Project,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReservedProperty::Uid => "UID",
            ReservedProperty::Summary => "SUMMARY",
            ReservedProperty::Status => "STATUS",
            ReservedProperty::Priority => "PRIORITY",
            ReservedProperty::Due => "DUE",
            ReservedProperty::Wait => "DTSTART",
            ReservedProperty::Categories => "CATEGORIES",
            ReservedProperty::Attach => "ATTACH",
            ReservedProperty::Project => "X-PROJECT",
        }
    }

    /// Case-insensitive lookup on the bare property name (no parameters).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// X-properties
// ---------------------------------------------------------------------------

/// Overflow bucket for every remote property the model does not recognise.
///
/// Keys are kept exactly as received. Nothing in the crate removes a key
/// unless an edit names it explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct XProperties(BTreeMap<String, String>);

impl XProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for XProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A file or link attached to a task (`ATTACH`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fmttype: Option<String>,
    /// Every other parameter (`ENCODING=BASE64`, `VALUE=BINARY`,
    /// `X-FILENAME=...`) as written, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
}

/// Every diffable attribute of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub summary: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "XProperties::is_empty")]
    pub x_properties: XProperties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl TaskFields {
    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// `true` while `now < wait`.
    pub fn is_waiting(&self, now: DateTime<Utc>) -> bool {
        self.wait.is_some_and(|wait| now < wait)
    }
}

/// A task as seen by readers: mirror state with pending edits applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub index: TaskIndex,
    /// `None` until a pending creation has been pushed.
    pub uid: Option<TaskUid>,
    #[serde(flatten)]
    pub fields: TaskFields,
    /// `true` when the task has local changes not yet pushed.
    pub dirty: bool,
}

/// Identity of a task inside diffs and journal entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub index: TaskIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<TaskUid>,
}

impl TaskRef {
    pub fn new(index: TaskIndex, uid: Option<TaskUid>) -> Self {
        Self { index, uid }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "#{} ({uid})", self.index),
            None => write!(f, "#{}", self.index),
        }
    }
}

/// Lookup key accepted by the store's `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKey {
    Index(TaskIndex),
    Uid(TaskUid),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Index(index) => write!(f, "index {index}"),
            TaskKey::Uid(uid) => write!(f, "uid {uid}"),
        }
    }
}

impl From<TaskIndex> for TaskKey {
    fn from(index: TaskIndex) -> Self {
        TaskKey::Index(index)
    }
}

impl From<TaskUid> for TaskKey {
    fn from(uid: TaskUid) -> Self {
        TaskKey::Uid(uid)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
