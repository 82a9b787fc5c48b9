//! Structured mutation requests produced by the token grammar.
//!
//! Nothing downstream of the parser ever sees raw command-line text: a
//! command becomes a [`MutationRequest`] whose edits are typed [`FieldEdit`]s
//! and whose target is a [`Selector`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::Field;
use crate::types::{Priority, Status, Task, TaskFields, TaskIndex};

// ---------------------------------------------------------------------------
// Edits
// ---------------------------------------------------------------------------

/// One field-level edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldEdit {
    Summary(String),
    Status(Status),
    Priority(Priority),
    Project(Option<String>),
    Due(Option<DateTime<Utc>>),
    Wait(Option<DateTime<Utc>>),
    AddTag(String),
    RemoveTag(String),
    SetProperty { name: String, value: String },
    UnsetProperty(String),
}

impl FieldEdit {
    /// Field this edit targets; `None` for tag operations, which accumulate.
    pub fn field(&self) -> Option<Field> {
        match self {
            FieldEdit::Summary(_) => Some(Field::Summary),
            FieldEdit::Status(_) => Some(Field::Status),
            FieldEdit::Priority(_) => Some(Field::Priority),
            FieldEdit::Project(_) => Some(Field::Project),
            FieldEdit::Due(_) => Some(Field::Due),
            FieldEdit::Wait(_) => Some(Field::Wait),
            FieldEdit::AddTag(_) | FieldEdit::RemoveTag(_) => None,
            FieldEdit::SetProperty { name, .. } | FieldEdit::UnsetProperty(name) => {
                Some(Field::XProperty(name.clone()))
            }
        }
    }

    fn apply(&self, fields: &mut TaskFields) {
        match self {
            FieldEdit::Summary(s) => fields.summary = s.clone(),
            FieldEdit::Status(s) => fields.status = *s,
            FieldEdit::Priority(p) => fields.priority = *p,
            FieldEdit::Project(p) => fields.project = p.clone(),
            FieldEdit::Due(at) => fields.due = *at,
            FieldEdit::Wait(at) => fields.wait = *at,
            FieldEdit::AddTag(tag) => {
                fields.tags.insert(tag.clone());
            }
            FieldEdit::RemoveTag(tag) => {
                fields.tags.remove(tag);
            }
            FieldEdit::SetProperty { name, value } => {
                fields.x_properties.insert(name.clone(), value.clone());
            }
            FieldEdit::UnsetProperty(name) => {
                fields.x_properties.remove(name);
            }
        }
    }
}

/// Normalised list of edits: at most one edit per field, tag operations in
/// encounter order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditRequest {
    edits: Vec<FieldEdit>,
}

impl EditRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edit. A later edit of the same field replaces the earlier one.
    pub fn push(&mut self, edit: FieldEdit) {
        if let Some(field) = edit.field() {
            self.edits.retain(|e| e.field().as_ref() != Some(&field));
        }
        self.edits.push(edit);
    }

    /// Apply every edit to a copy of `fields`.
    pub fn apply_to(&self, fields: &TaskFields) -> TaskFields {
        let mut out = fields.clone();
        for edit in &self.edits {
            edit.apply(&mut out);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldEdit> {
        self.edits.iter()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

impl FromIterator<FieldEdit> for EditRequest {
    fn from_iter<I: IntoIterator<Item = FieldEdit>>(iter: I) -> Self {
        let mut request = EditRequest::new();
        for edit in iter {
            request.push(edit);
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Metadata predicates for `list` and selectors. All set predicates must hold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub project: Option<String>,
    /// Tags that must be present.
    pub tags: Vec<String>,
    /// Tags that must be absent.
    pub without_tags: Vec<String>,
    pub due_before: Option<DateTime<Utc>>,
    pub due_after: Option<DateTime<Utc>>,
    pub wait_before: Option<DateTime<Utc>>,
    pub wait_after: Option<DateTime<Utc>>,
    /// Case-insensitive summary substrings.
    pub words: Vec<String>,
    /// Include COMPLETED / CANCELLED tasks.
    pub include_closed: bool,
    /// Include tasks whose `wait` is still in the future.
    pub include_waiting: bool,
    /// Only tasks whose `wait` is still in the future.
    pub waiting_only: bool,
}

impl TaskFilter {
    /// Default listing: open, not waiting.
    pub fn visible() -> Self {
        Self::default()
    }

    /// `tdo waiting`.
    pub fn waiting() -> Self {
        Self {
            include_waiting: true,
            waiting_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task, now: DateTime<Utc>) -> bool {
        let f = &task.fields;
        let waiting = f.is_waiting(now);

        let explicit_closed = self.status.is_some_and(|s| s.is_closed());
        if f.status.is_closed() && !(self.include_closed || explicit_closed) {
            return false;
        }
        let explicit_wait = self.wait_before.is_some() || self.wait_after.is_some();
        if waiting && !(self.include_waiting || explicit_wait) {
            return false;
        }
        if self.waiting_only && !waiting {
            return false;
        }
        if self.status.is_some_and(|s| s != f.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != f.priority) {
            return false;
        }
        if let Some(project) = &self.project {
            if f.project.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if !self.tags.iter().all(|t| f.tags.contains(t)) {
            return false;
        }
        if self.without_tags.iter().any(|t| f.tags.contains(t)) {
            return false;
        }
        if !within(f.due, self.due_before, self.due_after) {
            return false;
        }
        if !within(f.wait, self.wait_before, self.wait_after) {
            return false;
        }
        let summary = f.summary.to_lowercase();
        self.words
            .iter()
            .all(|w| summary.contains(&w.to_lowercase()))
    }
}

/// `before`/`after` bounds are exclusive; a missing instant never matches a bound.
fn within(
    at: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
) -> bool {
    match (at, before, after) {
        (_, None, None) => true,
        (None, _, _) => false,
        (Some(at), before, after) => {
            before.map_or(true, |b| at < b) && after.map_or(true, |a| at > a)
        }
    }
}

/// Which tasks a command targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// The full visible list (open, not waiting).
    #[default]
    Visible,
    /// Explicit indices; closed and waiting tasks are included.
    Indices(Vec<TaskIndex>),
    Filter(TaskFilter),
}

/// Parsed command intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationRequest {
    Create(TaskFields),
    Edit {
        selector: Selector,
        edits: EditRequest,
    },
    Delete(Selector),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
