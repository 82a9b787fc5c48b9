//! In-memory store document: mirror, pending, tombstones, index map, journal.
//!
//! [`Tables`] is what `tasks.json` deserialises into. Every operation here is
//! pure bookkeeping over the document; locking and persistence live in
//! [`crate::store`].
//!
//! Readers always see the *view* of a task: the mirror row with its pending
//! update applied, a pending creation as-is, and nothing for a task pending
//! deletion.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::{ConflictKind, ConflictNotice, TaskChange, TaskDiff, TaskSetDiff};
use crate::error::{SelectorError, StoreError, UndoError};
use crate::journal::Journal;
use crate::request::{EditRequest, Selector, TaskFilter};
use crate::types::{Task, TaskFields, TaskIndex, TaskKey, TaskRef, TaskUid};

/// Current `tasks.json` schema version.
pub const STORE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Monotonic index counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAllocator {
    next: u32,
}

impl Default for IndexAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IndexAllocator {
    pub fn allocate(&mut self) -> TaskIndex {
        let index = TaskIndex(self.next);
        self.next += 1;
        index
    }

    /// Hand back the most recent allocation so an undone `add` leaves the
    /// counter where it was. Older indices are never reused.
    pub fn release(&mut self, index: TaskIndex) {
        if index.0 + 1 == self.next {
            self.next = index.0;
        }
    }

    /// Make sure `index` is never handed out again.
    pub fn reserve(&mut self, index: TaskIndex) {
        if index.0 >= self.next {
            self.next = index.0 + 1;
        }
    }

    pub fn peek(&self) -> TaskIndex {
        TaskIndex(self.next)
    }

    fn reset(&mut self, next: u32) {
        self.next = next;
    }
}

/// Last-known remote state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub fields: TaskFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// A local change not yet pushed, keyed by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingRow {
    /// `uid` is minted locally so a retried create addresses the same record.
    Create {
        #[serde(default = "TaskUid::generate")]
        uid: TaskUid,
        fields: TaskFields,
    },
    Update { uid: TaskUid, diff: TaskDiff },
    Delete { uid: TaskUid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstoneOrigin {
    /// Deleted by a local command.
    Local,
    /// Vanished from the remote listing.
    Remote,
}

/// Remembers a deleted task so a stale listing cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub origin: TombstoneOrigin,
    /// Index the task had when it was deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<TaskIndex>,
    pub fields: TaskFields,
    pub deleted_at: DateTime<Utc>,
    /// The remote no longer has the task.
    #[serde(default)]
    pub confirmed: bool,
}

/// One remote write derived from a pending row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PushOp {
    Create {
        index: TaskIndex,
        uid: TaskUid,
        fields: TaskFields,
    },
    /// `fields` is the complete local view, not just the changed fields.
    Update {
        index: TaskIndex,
        uid: TaskUid,
        fields: TaskFields,
        etag: Option<String>,
    },
    Delete {
        index: TaskIndex,
        uid: TaskUid,
        etag: Option<String>,
    },
}

impl PushOp {
    pub fn index(&self) -> TaskIndex {
        match self {
            PushOp::Create { index, .. }
            | PushOp::Update { index, .. }
            | PushOp::Delete { index, .. } => *index,
        }
    }

    pub fn uid(&self) -> Option<&TaskUid> {
        match self {
            PushOp::Create { uid, .. } | PushOp::Update { uid, .. } | PushOp::Delete { uid, .. } => {
                Some(uid)
            }
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.index(), self.uid().cloned())
    }
}

/// Result of folding one fetched record into the tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A task the store had never seen.
    Created { index: TaskIndex },
    /// The remote copy differed from the mirror. `diff` is the change in the
    /// visible view, after pending local edits are rebased.
    Updated {
        index: TaskIndex,
        diff: TaskDiff,
        conflicts: Vec<ConflictNotice>,
    },
    Unchanged { index: TaskIndex },
    /// The task has a local tombstone; the record was ignored.
    Skipped,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// The whole persisted store document for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tables {
    pub version: u32,
    #[serde(default)]
    allocator: IndexAllocator,
    #[serde(default)]
    index: BTreeMap<TaskIndex, TaskUid>,
    /// Reverse of `index`; rebuilt on load.
    #[serde(skip)]
    by_uid: BTreeMap<TaskUid, TaskIndex>,
    #[serde(default)]
    mirror: BTreeMap<TaskUid, MirrorRow>,
    #[serde(default)]
    pending: BTreeMap<TaskIndex, PendingRow>,
    #[serde(default)]
    tombstones: BTreeMap<TaskUid, Tombstone>,
    #[serde(default)]
    pub journal: Journal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_at: Option<DateTime<Utc>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            allocator: IndexAllocator::default(),
            index: BTreeMap::new(),
            by_uid: BTreeMap::new(),
            mirror: BTreeMap::new(),
            pending: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            journal: Journal::default(),
            pulled_at: None,
            pushed_at: None,
        }
    }
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The visible task at `index`, if any.
    pub fn view(&self, index: TaskIndex) -> Option<Task> {
        match self.pending.get(&index) {
            Some(PendingRow::Create { fields, .. }) => Some(Task {
                index,
                uid: None,
                fields: fields.clone(),
                dirty: true,
            }),
            Some(PendingRow::Delete { .. }) => None,
            Some(PendingRow::Update { uid, diff }) => {
                let row = self.mirror.get(uid)?;
                Some(Task {
                    index,
                    uid: Some(uid.clone()),
                    fields: diff.apply_to(&row.fields),
                    dirty: true,
                })
            }
            None => {
                let uid = self.index.get(&index)?;
                let row = self.mirror.get(uid)?;
                Some(Task {
                    index,
                    uid: Some(uid.clone()),
                    fields: row.fields.clone(),
                    dirty: false,
                })
            }
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<Task> {
        match key {
            TaskKey::Index(index) => self.view(*index),
            TaskKey::Uid(uid) => self.index_of(uid).and_then(|index| self.view(index)),
        }
    }

    /// Index currently mapped to a mirrored uid.
    pub fn index_of(&self, uid: &TaskUid) -> Option<TaskIndex> {
        self.by_uid.get(uid).copied()
    }

    /// Rebuild the uid lookup after deserialising.
    pub(crate) fn rebuild_lookup(&mut self) {
        self.by_uid = self
            .index
            .iter()
            .map(|(index, uid)| (uid.clone(), *index))
            .collect();
    }

    fn link(&mut self, index: TaskIndex, uid: TaskUid) {
        if let Some(old) = self.index.insert(index, uid.clone()) {
            self.by_uid.remove(&old);
        }
        self.by_uid.insert(uid, index);
    }

    fn unlink(&mut self, index: TaskIndex) -> Option<TaskUid> {
        let uid = self.index.remove(&index)?;
        self.by_uid.remove(&uid);
        Some(uid)
    }

    /// Every visible task, in index order.
    pub fn tasks(&self) -> Vec<Task> {
        self.occupied()
            .into_iter()
            .filter_map(|index| self.view(index))
            .collect()
    }

    /// Tasks matching `filter`, in list order.
    pub fn list(&self, filter: &TaskFilter, now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks()
            .into_iter()
            .filter(|t| filter.matches(t, now))
            .collect();
        sort_tasks(&mut tasks);
        tasks
    }

    /// Resolve a selector to concrete tasks.
    ///
    /// Explicit indices reach closed and waiting tasks too; every missing
    /// index is reported at once.
    pub fn select(&self, selector: &Selector, now: DateTime<Utc>) -> Result<Vec<Task>, SelectorError> {
        match selector {
            Selector::Visible => Ok(self.list(&TaskFilter::visible(), now)),
            Selector::Indices(indices) => {
                let mut tasks = Vec::with_capacity(indices.len());
                let mut missing = Vec::new();
                let mut seen = BTreeSet::new();
                for index in indices {
                    if !seen.insert(*index) {
                        continue;
                    }
                    match self.view(*index) {
                        Some(task) => tasks.push(task),
                        None => missing.push(*index),
                    }
                }
                if missing.is_empty() {
                    Ok(tasks)
                } else {
                    Err(SelectorError::UnknownIndex(missing))
                }
            }
            Selector::Filter(filter) => {
                let tasks = self.list(filter, now);
                if tasks.is_empty() {
                    Err(SelectorError::NoMatch)
                } else {
                    Ok(tasks)
                }
            }
        }
    }

    pub fn mirror(&self, uid: &TaskUid) -> Option<&MirrorRow> {
        self.mirror.get(uid)
    }

    pub fn pending(&self) -> impl Iterator<Item = (&TaskIndex, &PendingRow)> {
        self.pending.iter()
    }

    pub fn tombstones(&self) -> impl Iterator<Item = (&TaskUid, &Tombstone)> {
        self.tombstones.iter()
    }

    pub fn tombstone(&self, uid: &TaskUid) -> Option<&Tombstone> {
        self.tombstones.get(uid)
    }

    pub fn next_index(&self) -> TaskIndex {
        self.allocator.peek()
    }

    /// Journal handle for `index`. A pending creation is referenced by its
    /// locally minted uid so the entry still resolves after a push.
    pub fn task_ref(&self, index: TaskIndex) -> TaskRef {
        let uid = self.uid_at(index).or_else(|| match self.pending.get(&index) {
            Some(PendingRow::Create { uid, .. }) => Some(uid.clone()),
            _ => None,
        });
        TaskRef::new(index, uid)
    }

    /// Every index in use: mirrored tasks plus pending creations.
    fn occupied(&self) -> BTreeSet<TaskIndex> {
        let mut indices: BTreeSet<TaskIndex> = self.index.keys().copied().collect();
        indices.extend(
            self.pending
                .iter()
                .filter(|(_, row)| matches!(row, PendingRow::Create { .. }))
                .map(|(index, _)| *index),
        );
        indices
    }

    fn is_free(&self, index: TaskIndex) -> bool {
        !self.index.contains_key(&index) && !self.pending.contains_key(&index)
    }

    fn uid_at(&self, index: TaskIndex) -> Option<TaskUid> {
        self.index.get(&index).cloned()
    }

    // -----------------------------------------------------------------------
    // Local mutations
    // -----------------------------------------------------------------------

    /// Record a new task as a pending creation.
    pub fn create(&mut self, fields: TaskFields) -> TaskIndex {
        let index = self.allocator.allocate();
        self.pending.insert(
            index,
            PendingRow::Create {
                uid: TaskUid::generate(),
                fields,
            },
        );
        index
    }

    /// Apply `diff` to the task at `index` and return the diff actually realised
    /// against the current view (fields already at their target drop out).
    pub fn apply(&mut self, index: TaskIndex, diff: &TaskDiff) -> Result<TaskDiff, StoreError> {
        let current = self
            .view(index)
            .ok_or(StoreError::UnknownTask(TaskKey::Index(index)))?;
        let target = diff.apply_to(&current.fields);
        let realised = TaskDiff::between(&current.fields, &target);
        if !realised.is_empty() {
            self.set_view(index, target);
        }
        Ok(realised)
    }

    /// Apply a parsed edit request to the task at `index`.
    pub fn edit(&mut self, index: TaskIndex, request: &EditRequest) -> Result<TaskDiff, StoreError> {
        let current = self
            .view(index)
            .ok_or(StoreError::UnknownTask(TaskKey::Index(index)))?;
        let target = request.apply_to(&current.fields);
        self.apply(index, &TaskDiff::between(&current.fields, &target))
    }

    /// Delete the task at `index` and return its last view.
    ///
    /// A pending creation simply disappears. A mirrored task becomes a pending
    /// deletion plus a local tombstone; its index stays reserved until the
    /// remote confirms.
    pub fn mark_deleted(&mut self, index: TaskIndex, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let task = self
            .view(index)
            .ok_or(StoreError::UnknownTask(TaskKey::Index(index)))?;
        match &task.uid {
            None => {
                self.pending.remove(&index);
                self.allocator.release(index);
            }
            Some(uid) => {
                self.pending
                    .insert(index, PendingRow::Delete { uid: uid.clone() });
                self.tombstones.insert(
                    uid.clone(),
                    Tombstone {
                        origin: TombstoneOrigin::Local,
                        index: Some(index),
                        fields: task.fields.clone(),
                        deleted_at: now,
                        confirmed: false,
                    },
                );
            }
        }
        Ok(task)
    }

    /// Make `target` the view of `index`, storing the minimal pending row.
    fn set_view(&mut self, index: TaskIndex, target: TaskFields) {
        if let Some(PendingRow::Create { fields, .. }) = self.pending.get_mut(&index) {
            *fields = target;
            return;
        }
        let Some(uid) = self.uid_at(index) else {
            return;
        };
        let Some(row) = self.mirror.get(&uid) else {
            return;
        };
        let diff = TaskDiff::between(&row.fields, &target);
        if diff.is_empty() {
            self.pending.remove(&index);
        } else {
            self.pending.insert(index, PendingRow::Update { uid, diff });
        }
    }

    /// Revert the newest journal entry and record the reversal.
    pub fn undo(&mut self, now: DateTime<Utc>) -> Result<TaskSetDiff, UndoError> {
        let target = self.journal.undo_target()?.clone();
        let mut applied = TaskSetDiff::new();

        for entry in target.diff.inverse().iter() {
            match &entry.change {
                // Reverting a deletion.
                TaskChange::Created { fields } => {
                    let index = self.restore(&entry.task, fields);
                    applied.push(self.task_ref(index), entry.change.clone());
                }
                // Reverting a creation.
                TaskChange::Deleted { .. } => {
                    let index = self.locate(&entry.task)?;
                    let task_ref = self.task_ref(index);
                    let task = self.mark_deleted(index, now)?;
                    applied.push(task_ref, TaskChange::Deleted { fields: task.fields });
                }
                TaskChange::Updated { diff } => {
                    let index = self.locate(&entry.task)?;
                    let realised = self.apply(index, diff)?;
                    let summary = self
                        .view(index)
                        .map(|t| t.fields.summary)
                        .unwrap_or_else(|| entry.summary.clone());
                    applied.push_update(self.task_ref(index), summary, realised);
                }
            }
        }

        tracing::debug!("undo of journal entry {} touched {} task(s)", target.seq, applied.len());
        self.journal
            .append("undo", applied.clone(), Some(target.seq), now);
        Ok(applied)
    }

    /// Find the current index of a task recorded in the journal. The uid wins
    /// when the task has been pushed since the entry was written.
    fn locate(&self, task: &TaskRef) -> Result<TaskIndex, StoreError> {
        if let Some(uid) = &task.uid {
            if let Some(index) = self.index_of(uid) {
                if self.view(index).is_some() {
                    return Ok(index);
                }
            }
        }
        if self.view(task.index).is_some() {
            return Ok(task.index);
        }
        Err(StoreError::UnknownTask(TaskKey::Index(task.index)))
    }

    /// Bring a deleted task back with `fields`.
    fn restore(&mut self, task: &TaskRef, fields: &TaskFields) -> TaskIndex {
        if let Some(index) = task.uid.as_ref().and_then(|uid| self.index_of(uid)) {
            if let Some(PendingRow::Delete { uid }) = self.pending.get(&index).cloned() {
                // The deletion never left the machine: cancel it.
                self.pending.remove(&index);
                self.tombstones.remove(&uid);
            }
            self.set_view(index, fields.clone());
            return index;
        }
        // Never pushed, or already gone remotely: recreate. A tombstoned uid
        // is not reused.
        let index = if self.is_free(task.index) {
            self.allocator.reserve(task.index);
            task.index
        } else {
            self.allocator.allocate()
        };
        let uid = task
            .uid
            .clone()
            .filter(|uid| !self.tombstones.contains_key(uid) && !self.mirror.contains_key(uid))
            .unwrap_or_else(TaskUid::generate);
        self.pending.insert(
            index,
            PendingRow::Create {
                uid,
                fields: fields.clone(),
            },
        );
        index
    }

    /// Renumber live tasks `1..=N` in list order (open before closed), purge
    /// confirmed local tombstones and clear the journal.
    ///
    /// Returns `(old, new)` pairs for every index that moved.
    pub fn compact(&mut self) -> Vec<(TaskIndex, TaskIndex)> {
        let mut live = self.tasks();
        sort_tasks(&mut live);
        live.sort_by_key(|t| t.fields.status.is_closed());

        let mut order: Vec<TaskIndex> = live.iter().map(|t| t.index).collect();
        // Pending deletions keep an index until pushed.
        let listed: BTreeSet<TaskIndex> = order.iter().copied().collect();
        let reserved: Vec<TaskIndex> = self
            .occupied_with_deletes()
            .into_iter()
            .filter(|i| !listed.contains(i))
            .collect();
        order.extend(reserved);

        let mut index = BTreeMap::new();
        let mut pending = BTreeMap::new();
        let mut moved = Vec::new();
        for (n, old) in order.iter().enumerate() {
            let new = TaskIndex(n as u32 + 1);
            if let Some(uid) = self.index.remove(old) {
                index.insert(new, uid);
            }
            if let Some(row) = self.pending.remove(old) {
                pending.insert(new, row);
            }
            if *old != new {
                moved.push((*old, new));
            }
        }
        self.index = index;
        self.rebuild_lookup();
        self.pending = pending;
        self.allocator.reset(order.len() as u32 + 1);

        self.tombstones
            .retain(|_, t| !(t.origin == TombstoneOrigin::Local && t.confirmed));
        for tombstone in self.tombstones.values_mut() {
            tombstone.index = None;
        }
        self.journal.clear();
        moved
    }

    fn occupied_with_deletes(&self) -> BTreeSet<TaskIndex> {
        let mut indices = self.occupied();
        indices.extend(self.pending.keys().copied());
        indices
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Fold one fetched record into the mirror.
    ///
    /// Pending local edits survive: they are rebased onto the new remote state,
    /// and every field changed on both sides to different values is reported.
    pub fn reconcile_from_remote(
        &mut self,
        uid: &TaskUid,
        fields: TaskFields,
        etag: Option<String>,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        if let Some(row) = self.mirror.get(uid).cloned() {
            let Some(index) = self.index_of(uid) else {
                // Mirror row without an index: repair by allocating one.
                let index = self.allocator.allocate();
                self.link(index, uid.clone());
                self.mirror.insert(uid.clone(), MirrorRow { fields, etag, synced_at: now });
                return ReconcileOutcome::Created { index };
            };
            let before = self.view(index).map(|t| t.fields);
            let remote_diff = TaskDiff::between(&row.fields, &fields);
            let mut conflicts = Vec::new();

            match self.pending.get(&index).cloned() {
                Some(PendingRow::Update { uid: pending_uid, diff: local }) => {
                    let summary = local.apply_to(&row.fields).summary;
                    for (field, change) in local.iter() {
                        if let Some(remote) = remote_diff.get(field) {
                            if remote.new != change.new {
                                conflicts.push(ConflictNotice {
                                    task: TaskRef::new(index, Some(uid.clone())),
                                    summary: summary.clone(),
                                    kind: ConflictKind::Field {
                                        field: field.clone(),
                                        local: change.new.clone(),
                                        remote: remote.new.clone(),
                                    },
                                });
                            }
                        }
                    }
                    let target = local.apply_to(&fields);
                    let rebased = TaskDiff::between(&fields, &target);
                    if rebased.is_empty() {
                        self.pending.remove(&index);
                    } else {
                        self.pending.insert(
                            index,
                            PendingRow::Update {
                                uid: pending_uid,
                                diff: rebased,
                            },
                        );
                    }
                }
                Some(PendingRow::Delete { .. }) if !remote_diff.is_empty() => {
                    conflicts.push(ConflictNotice {
                        task: TaskRef::new(index, Some(uid.clone())),
                        summary: fields.summary.clone(),
                        kind: ConflictKind::DeletedLocally,
                    });
                }
                _ => {}
            }

            self.mirror.insert(uid.clone(), MirrorRow { fields, etag, synced_at: now });

            let after = self.view(index).map(|t| t.fields);
            let diff = match (&before, &after) {
                (Some(b), Some(a)) => TaskDiff::between(b, a),
                _ => TaskDiff::new(),
            };
            for notice in &conflicts {
                tracing::warn!("{notice}");
            }
            if diff.is_empty() && conflicts.is_empty() {
                return ReconcileOutcome::Unchanged { index };
            }
            return ReconcileOutcome::Updated {
                index,
                diff,
                conflicts,
            };
        }

        if let Some((index, local)) = self.take_pending_create(uid) {
            // An earlier push landed but was never confirmed: adopt the
            // record and keep whatever differs locally as a pending update.
            tracing::debug!("{uid} matches pending creation {index}");
            self.tombstones.remove(uid);
            self.insert_mirrored(index, uid, fields.clone(), etag, now);
            let diff = TaskDiff::between(&fields, &local);
            if !diff.is_empty() {
                self.pending.insert(
                    index,
                    PendingRow::Update {
                        uid: uid.clone(),
                        diff,
                    },
                );
            }
            return ReconcileOutcome::Unchanged { index };
        }

        match self.tombstones.get(uid).map(|t| t.origin) {
            Some(TombstoneOrigin::Local) => {
                tracing::debug!("skipping {uid}: deleted locally");
                ReconcileOutcome::Skipped
            }
            Some(TombstoneOrigin::Remote) => {
                // Reappeared after a remote deletion.
                let previous = self.tombstones.remove(uid).and_then(|t| t.index);
                let index = match previous {
                    Some(index) if self.is_free(index) => {
                        self.allocator.reserve(index);
                        index
                    }
                    _ => self.allocator.allocate(),
                };
                self.insert_mirrored(index, uid, fields, etag, now);
                ReconcileOutcome::Created { index }
            }
            None => {
                let index = self.allocator.allocate();
                self.insert_mirrored(index, uid, fields, etag, now);
                ReconcileOutcome::Created { index }
            }
        }
    }

    fn take_pending_create(&mut self, uid: &TaskUid) -> Option<(TaskIndex, TaskFields)> {
        let index = self.pending.iter().find_map(|(index, row)| match row {
            PendingRow::Create { uid: minted, .. } if minted == uid => Some(*index),
            _ => None,
        })?;
        match self.pending.remove(&index)? {
            PendingRow::Create { fields, .. } => Some((index, fields)),
            other => {
                self.pending.insert(index, other);
                None
            }
        }
    }

    fn insert_mirrored(
        &mut self,
        index: TaskIndex,
        uid: &TaskUid,
        fields: TaskFields,
        etag: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.link(index, uid.clone());
        self.mirror
            .insert(uid.clone(), MirrorRow { fields, etag, synced_at: now });
    }

    /// Tombstone every mirrored task absent from a complete listing.
    ///
    /// Local edits to such a task are dropped and reported. Tombstones that
    /// predate this listing and are still absent from it are purged.
    pub fn tombstone_missing(
        &mut self,
        seen: &BTreeSet<TaskUid>,
        now: DateTime<Utc>,
    ) -> (TaskSetDiff, Vec<ConflictNotice>) {
        let existing: BTreeSet<TaskUid> = self.tombstones.keys().cloned().collect();
        let missing: Vec<TaskUid> = self
            .mirror
            .keys()
            .filter(|uid| !seen.contains(*uid))
            .cloned()
            .collect();

        let mut removed = TaskSetDiff::new();
        let mut conflicts = Vec::new();
        let mut fresh = BTreeSet::new();
        for uid in missing {
            let index = self.index_of(&uid);
            let view = index.and_then(|i| self.view(i));
            let Some(row) = self.mirror.remove(&uid) else {
                continue;
            };
            let mut origin = TombstoneOrigin::Remote;
            if let Some(index) = index {
                self.unlink(index);
                match self.pending.remove(&index) {
                    Some(PendingRow::Update { .. }) => {
                        let notice = ConflictNotice {
                            task: TaskRef::new(index, Some(uid.clone())),
                            summary: view
                                .as_ref()
                                .map(|t| t.fields.summary.clone())
                                .unwrap_or_else(|| row.fields.summary.clone()),
                            kind: ConflictKind::DeletedRemotely,
                        };
                        tracing::warn!("{notice}");
                        conflicts.push(notice);
                    }
                    Some(PendingRow::Delete { .. }) => origin = TombstoneOrigin::Local,
                    _ => {}
                }
                if origin == TombstoneOrigin::Remote {
                    removed.push(
                        TaskRef::new(index, Some(uid.clone())),
                        TaskChange::Deleted {
                            fields: view.map(|t| t.fields).unwrap_or_else(|| row.fields.clone()),
                        },
                    );
                }
            }
            self.tombstones.insert(
                uid.clone(),
                Tombstone {
                    origin,
                    index,
                    fields: row.fields,
                    deleted_at: now,
                    confirmed: true,
                },
            );
            fresh.insert(uid);
        }

        self.tombstones.retain(|uid, t| {
            fresh.contains(uid)
                || !existing.contains(uid)
                || seen.contains(uid)
                || (t.origin == TombstoneOrigin::Local && !t.confirmed)
        });
        (removed, conflicts)
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Snapshot of every pending row as a remote write.
    pub fn pending_operations(&self) -> Vec<PushOp> {
        self.pending
            .iter()
            .filter_map(|(index, row)| match row {
                PendingRow::Create { uid, fields } => Some(PushOp::Create {
                    index: *index,
                    uid: uid.clone(),
                    fields: fields.clone(),
                }),
                PendingRow::Update { uid, diff } => {
                    let mirror = self.mirror.get(uid)?;
                    Some(PushOp::Update {
                        index: *index,
                        uid: uid.clone(),
                        fields: diff.apply_to(&mirror.fields),
                        etag: mirror.etag.clone(),
                    })
                }
                PendingRow::Delete { uid } => Some(PushOp::Delete {
                    index: *index,
                    uid: uid.clone(),
                    etag: self.mirror.get(uid).and_then(|m| m.etag.clone()),
                }),
            })
            .collect()
    }

    /// Record a successful remote create. Edits made while the write was in
    /// flight stay pending against the new mirror row.
    pub fn confirm_create(
        &mut self,
        index: TaskIndex,
        pushed: &TaskFields,
        uid: TaskUid,
        etag: Option<String>,
        now: DateTime<Utc>,
    ) -> TaskIndex {
        let row = MirrorRow {
            fields: pushed.clone(),
            etag,
            synced_at: now,
        };
        match self.pending.get(&index).cloned() {
            Some(PendingRow::Create { fields: current, .. }) => {
                self.pending.remove(&index);
                self.link(index, uid.clone());
                self.mirror.insert(uid.clone(), row);
                let diff = TaskDiff::between(pushed, &current);
                if !diff.is_empty() {
                    self.pending.insert(index, PendingRow::Update { uid, diff });
                }
                index
            }
            _ => {
                // Deleted locally while the create was in flight.
                let index = if self.is_free(index) {
                    index
                } else {
                    self.allocator.allocate()
                };
                self.link(index, uid.clone());
                self.mirror.insert(uid.clone(), row);
                self.tombstones.insert(
                    uid.clone(),
                    Tombstone {
                        origin: TombstoneOrigin::Local,
                        index: Some(index),
                        fields: pushed.clone(),
                        deleted_at: now,
                        confirmed: false,
                    },
                );
                self.pending.insert(index, PendingRow::Delete { uid });
                index
            }
        }
    }

    /// Record a successful remote update.
    pub fn confirm_update(
        &mut self,
        uid: &TaskUid,
        pushed: &TaskFields,
        etag: Option<String>,
        now: DateTime<Utc>,
    ) {
        let Some(index) = self.index_of(uid) else {
            return;
        };
        let current = self.view(index).map(|t| t.fields);
        self.mirror.insert(
            uid.clone(),
            MirrorRow {
                fields: pushed.clone(),
                etag,
                synced_at: now,
            },
        );
        if let Some(current) = current {
            self.set_view(index, current);
        }
    }

    /// Record a successful remote delete (or a delete of a task the remote
    /// no longer had).
    pub fn confirm_delete(&mut self, uid: &TaskUid, now: DateTime<Utc>) {
        let index = self.index_of(uid);
        if let Some(index) = index {
            if matches!(self.pending.get(&index), Some(PendingRow::Delete { .. })) {
                self.pending.remove(&index);
            }
            self.unlink(index);
        }
        let row = self.mirror.remove(uid);
        let tombstone = self
            .tombstones
            .entry(uid.clone())
            .or_insert_with(|| Tombstone {
                origin: TombstoneOrigin::Local,
                index,
                fields: row.map(|r| r.fields).unwrap_or_default(),
                deleted_at: now,
                confirmed: false,
            });
        tombstone.confirmed = true;
    }
}

/// Due ascending (no due last), priority descending, then summary, uid, index.
pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        let (fa, fb) = (&a.fields, &b.fields);
        fa.due
            .is_none()
            .cmp(&fb.due.is_none())
            .then(fa.due.cmp(&fb.due))
            .then(fb.priority.cmp(&fa.priority))
            .then(fa.summary.cmp(&fb.summary))
            .then(a.uid.cmp(&b.uid))
            .then(a.index.cmp(&b.index))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::diff::{Change, Field, FieldState, Value};
    use crate::request::FieldEdit;
    use crate::types::{Priority, Status};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 9, 0, 0).unwrap()
    }

    fn mirrored(tables: &mut Tables, uid: &str, summary: &str) -> TaskIndex {
        match tables.reconcile_from_remote(
            &TaskUid::from(uid),
            TaskFields::with_summary(summary),
            Some("e1".into()),
            now(),
        ) {
            ReconcileOutcome::Created { index } => index,
            other => panic!("expected creation, got {other:?}"),
        }
    }

    fn edit(fields: &[FieldEdit]) -> EditRequest {
        fields.iter().cloned().collect()
    }

    #[test]
    fn created_tasks_get_increasing_indices() {
        let mut tables = Tables::new();
        let a = tables.create(TaskFields::with_summary("a"));
        let b = tables.create(TaskFields::with_summary("b"));
        assert_eq!((a, b), (TaskIndex(1), TaskIndex(2)));
        let view = tables.view(a).unwrap();
        assert!(view.uid.is_none());
        assert!(view.dirty);
    }

    #[test]
    fn edit_of_mirrored_task_stays_minimal() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "Fix bug");
        let diff = tables
            .edit(index, &edit(&[FieldEdit::Priority(Priority::High)]))
            .unwrap();
        assert_eq!(diff.len(), 1);
        assert!(tables.view(index).unwrap().dirty);

        // Editing back to the mirror value clears the pending row.
        tables
            .edit(index, &edit(&[FieldEdit::Priority(Priority::None)]))
            .unwrap();
        assert!(!tables.view(index).unwrap().dirty);
        assert!(tables.pending_operations().is_empty());
    }

    #[test]
    fn apply_reports_only_realised_changes() {
        let mut tables = Tables::new();
        let index = tables.create(TaskFields::with_summary("a"));
        let mut diff = TaskDiff::new();
        diff.insert(
            Field::Summary,
            Change {
                old: FieldState::Set(Value::Text("a".into())),
                new: FieldState::Set(Value::Text("a".into())),
            },
        );
        assert!(tables.apply(index, &diff).unwrap().is_empty());
    }

    #[test]
    fn unknown_index_is_an_error() {
        let mut tables = Tables::new();
        let err = tables.edit(TaskIndex(9), &EditRequest::new()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(TaskKey::Index(TaskIndex(9)))));
    }

    #[test]
    fn deleting_pending_create_releases_top_index() {
        let mut tables = Tables::new();
        let index = tables.create(TaskFields::with_summary("oops"));
        tables.mark_deleted(index, now()).unwrap();
        assert!(tables.view(index).is_none());
        assert_eq!(tables.next_index(), TaskIndex(1));
        assert!(tables.pending_operations().is_empty());
    }

    #[test]
    fn deleting_mirrored_task_queues_delete_and_tombstone() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "a");
        tables.mark_deleted(index, now()).unwrap();
        assert!(tables.view(index).is_none());
        let tombstone = tables.tombstone(&TaskUid::from("u1")).unwrap();
        assert_eq!(tombstone.origin, TombstoneOrigin::Local);
        assert!(matches!(
            tables.pending_operations()[..],
            [PushOp::Delete { .. }]
        ));

        // A stale listing must not resurrect it.
        let outcome = tables.reconcile_from_remote(
            &TaskUid::from("u1"),
            TaskFields::with_summary("a"),
            None,
            now(),
        );
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        assert!(tables.view(index).is_none());
    }

    #[test]
    fn locally_deleted_unknown_uid_is_skipped() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "a");
        tables.mark_deleted(index, now()).unwrap();
        tables.confirm_delete(&TaskUid::from("u1"), now());
        let outcome = tables.reconcile_from_remote(
            &TaskUid::from("u1"),
            TaskFields::with_summary("a"),
            None,
            now(),
        );
        assert_eq!(outcome, ReconcileOutcome::Skipped);
    }

    #[test]
    fn pull_rebases_local_edit_and_reports_conflict() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "a");
        tables
            .edit(
                index,
                &edit(&[
                    FieldEdit::Priority(Priority::High),
                    FieldEdit::Project(Some("home".into())),
                ]),
            )
            .unwrap();

        let mut remote = TaskFields::with_summary("a renamed");
        remote.priority = Priority::Low;
        let outcome = tables.reconcile_from_remote(&TaskUid::from("u1"), remote, None, now());
        let ReconcileOutcome::Updated { diff, conflicts, .. } = outcome else {
            panic!("expected update");
        };
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            &conflicts[0].kind,
            ConflictKind::Field { field: Field::Priority, .. }
        ));
        assert!(diff.contains(&Field::Summary));

        let view = tables.view(index).unwrap();
        assert_eq!(view.fields.summary, "a renamed");
        assert_eq!(view.fields.priority, Priority::High);
        assert_eq!(view.fields.project.as_deref(), Some("home"));
    }

    #[test]
    fn missing_remote_task_is_tombstoned_and_local_edit_dropped() {
        let mut tables = Tables::new();
        let keep = mirrored(&mut tables, "u1", "keep");
        let gone = mirrored(&mut tables, "u2", "gone");
        tables
            .edit(gone, &edit(&[FieldEdit::Status(Status::Completed)]))
            .unwrap();

        let seen: BTreeSet<TaskUid> = [TaskUid::from("u1")].into_iter().collect();
        let (removed, conflicts) = tables.tombstone_missing(&seen, now());
        assert_eq!(removed.deleted(), 1);
        assert_eq!(conflicts.len(), 1);
        assert!(tables.view(gone).is_none());
        assert!(tables.view(keep).is_some());
        assert!(tables.pending_operations().is_empty());

        // The next listing still lacks it: the tombstone is purged.
        tables.tombstone_missing(&seen, now());
        assert!(tables.tombstone(&TaskUid::from("u2")).is_none());
    }

    #[test]
    fn remote_reappearance_reuses_old_index() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "a");
        tables.tombstone_missing(&BTreeSet::new(), now());
        assert!(tables.view(index).is_none());
        let outcome = tables.reconcile_from_remote(
            &TaskUid::from("u1"),
            TaskFields::with_summary("a"),
            None,
            now(),
        );
        assert_eq!(outcome, ReconcileOutcome::Created { index });
    }

    #[test]
    fn confirm_create_keeps_in_flight_edits() {
        let mut tables = Tables::new();
        let index = tables.create(TaskFields::with_summary("a"));
        let ops = tables.pending_operations();
        let PushOp::Create { fields, .. } = &ops[0] else {
            panic!("expected create");
        };
        tables
            .edit(index, &edit(&[FieldEdit::AddTag("late".into())]))
            .unwrap();
        tables.confirm_create(index, fields, TaskUid::from("new-uid"), Some("e".into()), now());

        let view = tables.view(index).unwrap();
        assert_eq!(view.uid, Some(TaskUid::from("new-uid")));
        assert!(view.fields.tags.contains("late"));
        assert!(matches!(
            tables.pending_operations()[..],
            [PushOp::Update { .. }]
        ));
    }

    #[test]
    fn confirm_delete_frees_the_index() {
        let mut tables = Tables::new();
        let index = mirrored(&mut tables, "u1", "a");
        tables.mark_deleted(index, now()).unwrap();
        tables.confirm_delete(&TaskUid::from("u1"), now());
        assert!(tables.pending_operations().is_empty());
        assert!(tables.tombstone(&TaskUid::from("u1")).unwrap().confirmed);
        assert!(tables.tasks().is_empty());
    }

    #[test]
    fn list_orders_by_due_then_priority() {
        let mut tables = Tables::new();
        let mut late = TaskFields::with_summary("late");
        late.due = Some(now() + Duration::days(3));
        let mut soon = TaskFields::with_summary("soon");
        soon.due = Some(now() + Duration::days(1));
        let mut urgent = TaskFields::with_summary("urgent");
        urgent.priority = Priority::High;
        let plain = TaskFields::with_summary("plain");
        for f in [plain, late, urgent, soon] {
            tables.create(f);
        }
        let order: Vec<String> = tables
            .list(&TaskFilter::visible(), now())
            .into_iter()
            .map(|t| t.fields.summary)
            .collect();
        assert_eq!(order, ["soon", "late", "urgent", "plain"]);
    }

    #[test]
    fn explicit_indices_reach_closed_tasks() {
        let mut tables = Tables::new();
        let mut done = TaskFields::with_summary("done");
        done.status = Status::Completed;
        let index = tables.create(done);
        assert!(tables.select(&Selector::Visible, now()).unwrap().is_empty());
        assert_eq!(
            tables
                .select(&Selector::Indices(vec![index]), now())
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            tables.select(&Selector::Indices(vec![index, TaskIndex(7)]), now()),
            Err(SelectorError::UnknownIndex(vec![TaskIndex(7)]))
        );
    }

    #[test]
    fn compact_renumbers_open_before_closed() {
        let mut tables = Tables::new();
        let mut done = TaskFields::with_summary("done");
        done.status = Status::Completed;
        tables.create(TaskFields::with_summary("x"));
        tables.create(done);
        let gone = tables.create(TaskFields::with_summary("gone"));
        tables.create(TaskFields::with_summary("open"));
        tables.mark_deleted(gone, now()).unwrap();

        tables.compact();
        let summaries: Vec<(u32, String)> = tables
            .tasks()
            .into_iter()
            .map(|t| (t.index.0, t.fields.summary))
            .collect();
        assert_eq!(
            summaries,
            [(1, "open".into()), (2, "x".into()), (3, "done".into())]
        );
        assert_eq!(tables.next_index(), TaskIndex(4));
        assert!(tables.journal.is_empty());
    }

    #[test]
    fn compact_keeps_pending_deletes_after_live_tasks() {
        let mut tables = Tables::new();
        for (uid, summary) in [("u1", "gone"), ("u2", "a"), ("u3", "b")] {
            tables.reconcile_from_remote(
                &TaskUid::from(uid),
                TaskFields::with_summary(summary),
                None,
                now(),
            );
        }
        tables.mark_deleted(TaskIndex(1), now()).unwrap();

        tables.compact();
        let gone = TaskUid::from("u1");
        assert_eq!(tables.index_of(&gone), Some(TaskIndex(3)));
        let live: BTreeSet<_> = ["u2", "u3"]
            .into_iter()
            .filter_map(|uid| tables.index_of(&TaskUid::from(uid)))
            .collect();
        assert_eq!(live, BTreeSet::from([TaskIndex(1), TaskIndex(2)]));
        assert_eq!(tables.next_index(), TaskIndex(4));

        let ops = tables.pending_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].index(), TaskIndex(3));

        tables.confirm_delete(&gone, now());
        assert_eq!(tables.index_of(&gone), None);
    }

    #[test]
    fn uid_lookup_survives_serialisation() {
        let mut tables = Tables::new();
        tables.reconcile_from_remote(
            &TaskUid::from("u1"),
            TaskFields::with_summary("a"),
            None,
            now(),
        );
        let json = serde_json::to_string(&tables).unwrap();
        let mut back: Tables = serde_json::from_str(&json).unwrap();
        back.rebuild_lookup();
        assert_eq!(back.index_of(&TaskUid::from("u1")), Some(TaskIndex(1)));
    }
}
