//! Field-level task diffs and multi-task change sets.
//!
//! A [`TaskDiff`] maps each changed [`Field`] to its `(old, new)` pair. A field
//! that is not in the map is unchanged; a side that is [`FieldState::Unset`]
//! means the field is absent on that side, which is distinct from a field set
//! to an empty value.
//!
//! Laws:
//! - `TaskDiff::between(a, b).apply_to(a) == b`
//! - `TaskDiff::between(a, d.apply_to(a)) == d` for any `d` built from `a`
//! - `d.inverse().apply_to(d.apply_to(a)) == a`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Attachment, Priority, Status, TaskFields, TaskRef};

// ---------------------------------------------------------------------------
// Field keys and values
// ---------------------------------------------------------------------------

/// A diffable attribute. X-properties are diffed one key at a time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Field {
    Summary,
    Status,
    Priority,
    Project,
    Tags,
    Due,
    Wait,
    Attachments,
    XProperty(String),
}

impl Field {
    /// Every fixed field, in diff order.
    pub const FIXED: [Field; 8] = [
        Field::Summary,
        Field::Status,
        Field::Priority,
        Field::Project,
        Field::Tags,
        Field::Due,
        Field::Wait,
        Field::Attachments,
    ];

    /// Read the current state of this field from `fields`.
    pub fn read(&self, fields: &TaskFields) -> FieldState {
        match self {
            Field::Summary => FieldState::Set(Value::Text(fields.summary.clone())),
            Field::Status => FieldState::Set(Value::Status(fields.status)),
            Field::Priority => match fields.priority {
                Priority::None => FieldState::Unset,
                p => FieldState::Set(Value::Priority(p)),
            },
            Field::Project => FieldState::from_option(fields.project.clone().map(Value::Text)),
            Field::Tags if fields.tags.is_empty() => FieldState::Unset,
            Field::Tags => FieldState::Set(Value::Tags(fields.tags.clone())),
            Field::Due => FieldState::from_option(fields.due.map(Value::Instant)),
            Field::Wait => FieldState::from_option(fields.wait.map(Value::Instant)),
            Field::Attachments if fields.attachments.is_empty() => FieldState::Unset,
            Field::Attachments => FieldState::Set(Value::Attachments(fields.attachments.clone())),
            Field::XProperty(name) => FieldState::from_option(
                fields.x_properties.get(name).map(|v| Value::Text(v.to_owned())),
            ),
        }
    }

    /// Overwrite this field in `fields`. A value of the wrong kind is ignored.
    pub fn write(&self, fields: &mut TaskFields, state: &FieldState) {
        match (self, state) {
            (Field::Summary, FieldState::Set(Value::Text(s))) => fields.summary = s.clone(),
            (Field::Summary, FieldState::Unset) => fields.summary.clear(),
            (Field::Status, FieldState::Set(Value::Status(s))) => fields.status = *s,
            (Field::Status, FieldState::Unset) => fields.status = Status::default(),
            (Field::Priority, FieldState::Set(Value::Priority(p))) => fields.priority = *p,
            (Field::Priority, FieldState::Unset) => fields.priority = Priority::None,
            (Field::Project, FieldState::Set(Value::Text(p))) => fields.project = Some(p.clone()),
            (Field::Project, FieldState::Unset) => fields.project = None,
            (Field::Tags, FieldState::Set(Value::Tags(t))) => fields.tags = t.clone(),
            (Field::Tags, FieldState::Unset) => fields.tags.clear(),
            (Field::Due, FieldState::Set(Value::Instant(at))) => fields.due = Some(*at),
            (Field::Due, FieldState::Unset) => fields.due = None,
            (Field::Wait, FieldState::Set(Value::Instant(at))) => fields.wait = Some(*at),
            (Field::Wait, FieldState::Unset) => fields.wait = None,
            (Field::Attachments, FieldState::Set(Value::Attachments(a))) => {
                fields.attachments = a.clone()
            }
            (Field::Attachments, FieldState::Unset) => fields.attachments.clear(),
            (Field::XProperty(name), FieldState::Set(Value::Text(v))) => {
                fields.x_properties.insert(name.clone(), v.clone());
            }
            (Field::XProperty(name), FieldState::Unset) => {
                fields.x_properties.remove(name);
            }
            (field, state) => {
                tracing::warn!("ignoring mismatched value {state:?} for field {field}");
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Summary => f.write_str("summary"),
            Field::Status => f.write_str("status"),
            Field::Priority => f.write_str("priority"),
            Field::Project => f.write_str("project"),
            Field::Tags => f.write_str("tags"),
            Field::Due => f.write_str("due"),
            Field::Wait => f.write_str("wait"),
            Field::Attachments => f.write_str("attachments"),
            Field::XProperty(name) => write!(f, "x:{name}"),
        }
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("x:") {
            if name.is_empty() {
                return Err("empty x-property name".to_string());
            }
            return Ok(Field::XProperty(name.to_string()));
        }
        Field::FIXED
            .into_iter()
            .find(|field| field.to_string() == s)
            .ok_or_else(|| format!("unknown field '{s}'"))
    }
}

impl TryFrom<String> for Field {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        field.to_string()
    }
}

/// A concrete field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Status(Status),
    Priority(Priority),
    Tags(BTreeSet<String>),
    Instant(DateTime<Utc>),
    Attachments(Vec<Attachment>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Status(s) => s.fmt(f),
            Value::Priority(p) => p.fmt(f),
            Value::Tags(tags) => {
                let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", joined.join(", "))
            }
            Value::Instant(at) => f.write_str(&at.format("%Y-%m-%d %H:%M").to_string()),
            Value::Attachments(a) => write!(f, "{} attachment(s)", a.len()),
        }
    }
}

/// One side of a field change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Unset,
    Set(Value),
}

impl FieldState {
    fn from_option(value: Option<Value>) -> Self {
        value.map_or(FieldState::Unset, FieldState::Set)
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, FieldState::Unset)
    }
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldState::Unset => f.write_str("(unset)"),
            FieldState::Set(value) => value.fmt(f),
        }
    }
}

/// `(old, new)` pair for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub old: FieldState,
    pub new: FieldState,
}

impl Change {
    pub fn inverse(&self) -> Change {
        Change {
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDiff
// ---------------------------------------------------------------------------

/// Field-level difference between two versions of one task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskDiff {
    changes: BTreeMap<Field, Change>,
}

impl TaskDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural comparison of every field and every x-property key.
    pub fn between(before: &TaskFields, after: &TaskFields) -> TaskDiff {
        let x_keys: BTreeSet<&str> = before
            .x_properties
            .keys()
            .chain(after.x_properties.keys())
            .collect();
        let fields = Field::FIXED
            .into_iter()
            .chain(x_keys.into_iter().map(|k| Field::XProperty(k.to_string())));

        let mut diff = TaskDiff::new();
        for field in fields {
            let old = field.read(before);
            let new = field.read(after);
            if old != new {
                diff.changes.insert(field, Change { old, new });
            }
        }
        diff
    }

    /// Write every `new` side onto a copy of `fields`.
    pub fn apply_to(&self, fields: &TaskFields) -> TaskFields {
        let mut out = fields.clone();
        for (field, change) in &self.changes {
            field.write(&mut out, &change.new);
        }
        out
    }

    pub fn inverse(&self) -> TaskDiff {
        TaskDiff {
            changes: self
                .changes
                .iter()
                .map(|(field, change)| (field.clone(), change.inverse()))
                .collect(),
        }
    }

    /// Record a change, replacing any earlier entry for the same field.
    pub fn insert(&mut self, field: Field, change: Change) -> Option<Change> {
        self.changes.insert(field, change)
    }

    pub fn get(&self, field: &Field) -> Option<&Change> {
        self.changes.get(field)
    }

    pub fn remove(&mut self, field: &Field) -> Option<Change> {
        self.changes.remove(field)
    }

    pub fn contains(&self, field: &Field) -> bool {
        self.changes.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Field, &Change)> {
        self.changes.iter()
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.changes.keys()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TaskSetDiff
// ---------------------------------------------------------------------------

/// What happened to one task inside a [`TaskSetDiff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskChange {
    Created { fields: TaskFields },
    Updated { diff: TaskDiff },
    Deleted { fields: TaskFields },
}

impl TaskChange {
    pub fn inverse(&self) -> TaskChange {
        match self {
            TaskChange::Created { fields } => TaskChange::Deleted {
                fields: fields.clone(),
            },
            TaskChange::Deleted { fields } => TaskChange::Created {
                fields: fields.clone(),
            },
            TaskChange::Updated { diff } => TaskChange::Updated {
                diff: diff.inverse(),
            },
        }
    }
}

/// One entry of a [`TaskSetDiff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSetEntry {
    pub task: TaskRef,
    /// Summary of the task when the change was recorded.
    #[serde(default)]
    pub summary: String,
    #[serde(flatten)]
    pub change: TaskChange,
}

/// Ordered collection of per-task changes produced by one command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskSetDiff {
    entries: Vec<TaskSetEntry>,
}

impl TaskSetDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskRef, change: TaskChange) {
        let summary = match &change {
            TaskChange::Created { fields } | TaskChange::Deleted { fields } => fields.summary.clone(),
            TaskChange::Updated { .. } => String::new(),
        };
        self.entries.push(TaskSetEntry {
            task,
            summary,
            change,
        });
    }

    /// Record an update, skipping empty diffs.
    pub fn push_update(&mut self, task: TaskRef, summary: impl Into<String>, diff: TaskDiff) {
        if !diff.is_empty() {
            self.entries.push(TaskSetEntry {
                task,
                summary: summary.into(),
                change: TaskChange::Updated { diff },
            });
        }
    }

    pub fn extend(&mut self, other: TaskSetDiff) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[TaskSetEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSetEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn created(&self) -> usize {
        self.count(|c| matches!(c, TaskChange::Created { .. }))
    }

    pub fn updated(&self) -> usize {
        self.count(|c| matches!(c, TaskChange::Updated { .. }))
    }

    pub fn deleted(&self) -> usize {
        self.count(|c| matches!(c, TaskChange::Deleted { .. }))
    }

    /// Undo order: last change first, each change inverted.
    pub fn inverse(&self) -> TaskSetDiff {
        TaskSetDiff {
            entries: self
                .entries
                .iter()
                .rev()
                .map(|entry| TaskSetEntry {
                    task: entry.task.clone(),
                    summary: entry.summary.clone(),
                    change: entry.change.inverse(),
                })
                .collect(),
        }
    }

    fn count(&self, pred: impl Fn(&TaskChange) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.change)).count()
    }
}

/// Grouped human-readable summary:
///
/// ```text
/// Created (1):
///   + [3] Write report
/// Updated (1):
///   ~ [1] Fix bug
///       priority: (unset) → H
/// ```
impl fmt::Display for TaskSetDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes.");
        }

        let sections: [(&str, usize, fn(&TaskChange) -> bool); 3] = [
            ("Created", self.created(), |c| matches!(c, TaskChange::Created { .. })),
            ("Updated", self.updated(), |c| matches!(c, TaskChange::Updated { .. })),
            ("Deleted", self.deleted(), |c| matches!(c, TaskChange::Deleted { .. })),
        ];
        for (title, count, pred) in sections {
            if count == 0 {
                continue;
            }
            writeln!(f, "{title} ({count}):")?;
            for entry in self.entries.iter().filter(|e| pred(&e.change)) {
                let index = entry.task.index;
                let label = &entry.summary;
                match &entry.change {
                    TaskChange::Created { .. } => writeln!(f, "  + [{index}] {label}")?,
                    TaskChange::Deleted { .. } => writeln!(f, "  - [{index}] {label}")?,
                    TaskChange::Updated { diff } => {
                        writeln!(f, "  ~ [{index}] {label}")?;
                        for (field, change) in diff.iter() {
                            writeln!(f, "      {field}: {} → {}", change.old, change.new)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// How a local pending change collided with a remote change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the field; the local value was kept.
    Field {
        field: Field,
        local: FieldState,
        remote: FieldState,
    },
    /// The task is pending deletion locally but changed remotely; the delete stands.
    DeletedLocally,
    /// The task vanished remotely while it had local edits; the edits were dropped.
    DeletedRemotely,
}

/// A change made on both sides, resolved by policy and reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub task: TaskRef,
    pub summary: String,
    #[serde(flatten)]
    pub kind: ConflictKind,
}

impl fmt::Display for ConflictNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.task.index;
        match &self.kind {
            ConflictKind::Field {
                field,
                local,
                remote,
            } => write!(
                f,
                "[{index}] {}: {field} changed on both sides; kept local {local} over remote {remote}",
                self.summary
            ),
            ConflictKind::DeletedLocally => write!(
                f,
                "[{index}] {}: changed remotely but pending local deletion; deletion kept",
                self.summary
            ),
            ConflictKind::DeletedRemotely => write!(
                f,
                "[{index}] {}: deleted remotely; local edits dropped",
                self.summary
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::types::TaskIndex;

    fn base() -> TaskFields {
        let mut fields = TaskFields::with_summary("Refactor sync layer");
        fields.priority = Priority::High;
        fields.tags.insert("backlog".into());
        fields.x_properties.insert("X-APPLE-SORT-ORDER", "10");
        fields.x_properties.insert("X-OTHER", "keep");
        fields
    }

    #[test]
    fn unset_is_explicit() {
        let before = base();
        let mut after = before.clone();
        after.priority = Priority::None;
        let diff = TaskDiff::between(&before, &after);
        let change = diff.get(&Field::Priority).expect("priority entry");
        assert!(change.new.is_unset());
        assert_eq!(diff.len(), 1);
    }

    #[test]
    fn empty_project_is_not_unset() {
        let before = base();
        let mut after = before.clone();
        after.project = Some(String::new());
        let diff = TaskDiff::between(&before, &after);
        assert_eq!(
            diff.get(&Field::Project).map(|c| &c.new),
            Some(&FieldState::Set(Value::Text(String::new())))
        );
    }

    #[test]
    fn x_properties_are_diffed_per_key() {
        let before = base();
        let mut after = before.clone();
        after.x_properties.insert("X-APPLE-SORT-ORDER", "20");
        after.x_properties.insert("X-NEW", "1");

        let diff = TaskDiff::between(&before, &after);
        assert!(diff.contains(&Field::XProperty("X-APPLE-SORT-ORDER".into())));
        assert!(diff.contains(&Field::XProperty("X-NEW".into())));
        assert!(!diff.contains(&Field::XProperty("X-OTHER".into())));
        assert_eq!(diff.apply_to(&before), after);
    }

    /// A diff whose `old` sides are read from `base()`.
    fn built_from_base(edits: Vec<(Field, FieldState)>) -> TaskDiff {
        let before = base();
        let mut diff = TaskDiff::new();
        for (field, new) in edits {
            let old = field.read(&before);
            diff.insert(field, Change { old, new });
        }
        diff
    }

    #[rstest]
    #[case::summary(vec![(Field::Summary, FieldState::Set(Value::Text("Ship it".into())))])]
    #[case::clear_priority(vec![(Field::Priority, FieldState::Unset)])]
    #[case::empty_project(vec![(Field::Project, FieldState::Set(Value::Text(String::new())))])]
    #[case::clear_tags(vec![(Field::Tags, FieldState::Unset)])]
    #[case::due(vec![(
        Field::Due,
        FieldState::Set(Value::Instant(Utc.with_ymd_and_hms(2025, 6, 12, 7, 0, 0).unwrap())),
    )])]
    #[case::x_properties(vec![
        (Field::XProperty("X-OTHER".into()), FieldState::Unset),
        (Field::XProperty("X-NEW".into()), FieldState::Set(Value::Text("1".into()))),
    ])]
    #[case::mixed(vec![
        (Field::Status, FieldState::Set(Value::Status(Status::Completed))),
        (Field::Wait, FieldState::Set(Value::Instant(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()))),
        (Field::Attachments, FieldState::Set(Value::Attachments(vec![Attachment {
            uri: "https://example.com/a.pdf".into(),
            fmttype: None,
            params: Vec::new(),
        }]))),
    ])]
    fn diff_of_applied_diff_is_the_diff(#[case] edits: Vec<(Field, FieldState)>) {
        let before = base();
        let diff = built_from_base(edits);
        assert_eq!(TaskDiff::between(&before, &diff.apply_to(&before)), diff);
    }

    #[test]
    fn inverse_restores_original() {
        let before = base();
        let mut after = before.clone();
        after.due = Some(Utc.with_ymd_and_hms(2025, 6, 10, 23, 59, 59).unwrap());
        after.x_properties.remove("X-OTHER");
        let diff = TaskDiff::between(&before, &after);
        assert_eq!(diff.inverse().apply_to(&after), before);
    }

    #[test]
    fn field_keys_roundtrip_through_strings() {
        for field in Field::FIXED {
            assert_eq!(field.to_string().parse::<Field>().unwrap(), field);
        }
        assert_eq!(
            "x:X-FOO".parse::<Field>().unwrap(),
            Field::XProperty("X-FOO".into())
        );
        assert!("x:".parse::<Field>().is_err());
    }

    #[test]
    fn diff_serializes_as_string_keyed_map() {
        let before = base();
        let mut after = before.clone();
        after.x_properties.insert("X-NEW", "1");
        let diff = TaskDiff::between(&before, &after);
        let json = serde_json::to_value(&diff).expect("serialize");
        assert!(json.get("x:X-NEW").is_some(), "got {json}");
        let back: TaskDiff = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, diff);
    }

    #[test]
    fn set_diff_counts_and_inverse() {
        let mut set = TaskSetDiff::new();
        let a = TaskRef::new(TaskIndex(1), None);
        let b = TaskRef::new(TaskIndex(2), None);
        set.push(a.clone(), TaskChange::Created { fields: base() });
        set.push_update(b.clone(), "noop", TaskDiff::new());
        set.push(b, TaskChange::Deleted { fields: base() });
        assert_eq!((set.created(), set.updated(), set.deleted()), (1, 0, 1));

        let inv = set.inverse();
        assert_eq!(inv.entries()[0].task.index, TaskIndex(2));
        assert!(matches!(inv.entries()[0].change, TaskChange::Created { .. }));
        assert!(matches!(inv.entries()[1].change, TaskChange::Deleted { .. }));
    }

    #[test]
    fn summary_rendering_groups_by_kind() {
        let before = base();
        let mut after = before.clone();
        after.tags.insert("urgent".into());
        let mut set = TaskSetDiff::new();
        set.push_update(
            TaskRef::new(TaskIndex(1), None),
            "Fix bug",
            TaskDiff::between(&before, &after),
        );
        set.push(TaskRef::new(TaskIndex(2), None), TaskChange::Created { fields: before });
        let text = set.to_string();
        assert!(text.contains("Created (1):\n  + [2] Refactor sync layer"), "{text}");
        assert!(text.contains("Updated (1):\n  ~ [1] Fix bug"), "{text}");
        assert!(text.contains("tags: {backlog} → {backlog, urgent}"), "{text}");
    }
}
