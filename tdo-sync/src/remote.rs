//! The remote collection contract.
//!
//! A [`RemoteClient`] is bound to one collection when it is constructed.
//! Calls are blocking; the pipeline runs them on the blocking pool.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tdo_core::{Attachment, Priority, ReservedProperty, Status, TaskFields, TaskUid, XProperties};

use crate::error::RemoteError;

/// One VTODO as the remote holds it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteTaskRecord {
    /// `None` for a record that has never been stored.
    pub uid: Option<TaskUid>,
    /// Content version. On `put`, a non-empty etag is a write precondition.
    pub etag: Option<String>,
    pub summary: String,
    pub status: Status,
    pub priority: Priority,
    pub due: Option<DateTime<Utc>>,
    /// `DTSTART`.
    pub wait: Option<DateTime<Utc>>,
    pub categories: BTreeSet<String>,
    pub attach: Vec<Attachment>,
    /// Every other property, keyed by its head, value untouched.
    pub properties: BTreeMap<String, String>,
    /// `DUE` exactly as the collection wrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_line: Option<SourceLine>,
    /// `DTSTART` exactly as the collection wrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_line: Option<SourceLine>,
}

/// A date-time content line in its original form (`TZID`, floating or
/// date-only), with the instant it decoded to. The encoder writes it back
/// unchanged as long as the instant has not been edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLine {
    pub head: String,
    pub value: String,
    pub at: DateTime<Utc>,
}

impl RemoteTaskRecord {
    /// Build the record to store for `fields`. `X-PROJECT` is written from
    /// the project, under its original head when it had parameters; every
    /// x-property is carried over.
    pub fn from_fields(uid: Option<TaskUid>, etag: Option<String>, fields: &TaskFields) -> Self {
        let mut properties = BTreeMap::new();
        let mut project_head = None;
        for (key, value) in fields.x_properties.iter() {
            if !is_project_key(key) {
                properties.insert(key.to_owned(), value.to_owned());
                continue;
            }
            match &fields.project {
                Some(_) => {
                    project_head.get_or_insert_with(|| key.to_owned());
                }
                // An empty `X-PROJECT` the remote already had stays.
                None if value.is_empty() => {
                    properties.insert(key.to_owned(), String::new());
                }
                None => {}
            }
        }
        if let Some(project) = &fields.project {
            let head =
                project_head.unwrap_or_else(|| ReservedProperty::Project.name().to_owned());
            properties.insert(head, project.clone());
        }
        Self {
            uid,
            etag,
            summary: fields.summary.clone(),
            status: fields.status,
            priority: fields.priority,
            due: fields.due,
            wait: fields.wait,
            categories: fields.tags.clone(),
            attach: fields.attachments.clone(),
            properties,
            due_line: None,
            wait_line: None,
        }
    }

    /// Keep `previous`'s original `DUE`/`DTSTART` lines where this record
    /// still holds the same instants.
    pub fn keep_source_lines(&mut self, previous: &RemoteTaskRecord) {
        let same = |line: &Option<SourceLine>, at: Option<DateTime<Utc>>| {
            line.as_ref().filter(|l| Some(l.at) == at).cloned()
        };
        if self.due_line.is_none() {
            self.due_line = same(&previous.due_line, self.due);
        }
        if self.wait_line.is_none() {
            self.wait_line = same(&previous.wait_line, self.wait);
        }
    }

    /// The local field view of this record.
    pub fn to_fields(&self) -> TaskFields {
        let mut project = None;
        let mut x_properties = XProperties::new();
        for (key, value) in &self.properties {
            if is_project_key(key) {
                if project.is_none() && !value.is_empty() {
                    project = Some(value.clone());
                }
                // Parameters and empty values can only travel in the map.
                if key.as_str() != ReservedProperty::Project.name() || value.is_empty() {
                    x_properties.insert(key.clone(), value.clone());
                }
            } else {
                x_properties.insert(key.clone(), value.clone());
            }
        }
        TaskFields {
            summary: self.summary.clone(),
            status: self.status,
            priority: self.priority,
            project,
            tags: self.categories.clone(),
            due: self.due,
            wait: self.wait,
            x_properties,
            attachments: self.attach.clone(),
        }
    }
}

fn is_project_key(key: &str) -> bool {
    let name = key.split([';', '#']).next().unwrap_or(key);
    name.eq_ignore_ascii_case(ReservedProperty::Project.name())
}

/// Acknowledgement of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub uid: TaskUid,
    pub etag: Option<String>,
}

/// A remote task collection.
pub trait RemoteClient: Send + Sync + 'static {
    /// Complete listing of the collection.
    fn fetch_all(&self) -> Result<Vec<RemoteTaskRecord>, RemoteError>;

    /// Create (no uid) or replace a record. Replacing with a stale etag
    /// fails with [`RemoteError::PreconditionFailed`].
    fn put(&self, record: &RemoteTaskRecord) -> Result<PutReceipt, RemoteError>;

    /// Remove a record. A missing record is [`RemoteError::NotFound`].
    fn delete(&self, uid: &TaskUid, etag: Option<&str>) -> Result<(), RemoteError>;
}
