//! Locked, atomically persisted task store for one environment.
//!
//! Every mutating command runs as one transaction: take the environment lock,
//! load `tasks.json`, mutate the in-memory [`Tables`], append the journal
//! entry, write the document back atomically. A failure anywhere before the
//! final `rename` leaves the previous document in place.
//!
//! Write flow: serialize → `tasks.json.tmp` sibling → `chmod 0600` → `rename`.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;

use crate::diff::{TaskChange, TaskSetDiff};
use crate::env::{set_dir_permissions, set_file_permissions, store_path_at};
use crate::error::{io_err, SelectorError, StoreError, UndoError};
use crate::request::{EditRequest, Selector, TaskFilter};
use crate::tables::Tables;
use crate::types::{EnvName, Task, TaskFields, TaskIndex, TaskKey};

/// How long a command waits for another process to release the lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const LOCK_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    lock_wait: Duration,
}

impl Store {
    /// Store for `env` under `<home>/.cache/tdo/<env>/`.
    pub fn open_at(home: &Path, env: &EnvName) -> Store {
        Store::at_path(store_path_at(home, env))
    }

    /// `open_at` convenience wrapper.
    pub fn open(env: &EnvName) -> Result<Store, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeNotFound)?;
        Ok(Store::open_at(&home, env))
    }

    /// Store backed by an explicit document path. The lock file sits next to it.
    pub fn at_path(path: impl Into<PathBuf>) -> Store {
        Store {
            path: path.into(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Store {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Consistent snapshot under a shared lock.
    pub fn read(&self) -> Result<Tables, StoreError> {
        let _lock = self.lock(false)?;
        self.load()
    }

    /// Run `f` against the tables under the exclusive lock and persist the
    /// result if it succeeds. Nothing is written when `f` fails.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&mut Tables) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _lock = self.lock(true)?;
        let mut tables = self.load()?;
        let out = f(&mut tables)?;
        self.save(&tables)?;
        Ok(out)
    }

    /// Run a local command: `f` records what it did into the change set,
    /// which is journaled under `operation` in the same transaction.
    pub fn commit<E>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Tables, &mut TaskSetDiff) -> Result<(), E>,
    ) -> Result<TaskSetDiff, E>
    where
        E: From<StoreError>,
    {
        self.transaction(|tables| {
            let mut changes = TaskSetDiff::new();
            f(tables, &mut changes)?;
            if let Some(seq) = tables
                .journal
                .append(operation, changes.clone(), None, Utc::now())
            {
                tracing::debug!("{operation}: journal entry {seq}, {} change(s)", changes.len());
            }
            Ok(changes)
        })
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Add a task as a pending creation.
    pub fn create(&self, fields: TaskFields) -> Result<(TaskIndex, TaskSetDiff), StoreError> {
        let mut created = TaskIndex(0);
        let changes = self.commit("add", |tables, changes| {
            created = tables.create(fields.clone());
            changes.push(tables.task_ref(created), TaskChange::Created { fields });
            Ok::<_, StoreError>(())
        })?;
        Ok((created, changes))
    }

    /// Apply one edit request to each task in `targets`.
    pub fn edit(
        &self,
        operation: &str,
        targets: &[Task],
        request: &EditRequest,
    ) -> Result<TaskSetDiff, StoreError> {
        self.commit(operation, |tables, changes| {
            edit_each(tables, changes, targets, request)
        })
    }

    /// Resolve `selector` and edit the matches in the same transaction, so a
    /// concurrent command cannot renumber the targets in between.
    ///
    /// A selector that matches nothing fails with [`StoreError::Selector`].
    pub fn edit_selected(
        &self,
        operation: &str,
        selector: &Selector,
        request: &EditRequest,
        now: DateTime<Utc>,
    ) -> Result<TaskSetDiff, StoreError> {
        self.commit(operation, |tables, changes| {
            let targets = select_some(tables, selector, now)?;
            edit_each(tables, changes, &targets, request)
        })
    }

    /// Delete each task in `targets`.
    pub fn delete(&self, targets: &[Task]) -> Result<TaskSetDiff, StoreError> {
        self.commit("delete", |tables, changes| {
            delete_each(tables, changes, targets, Utc::now())
        })
    }

    /// `delete` counterpart of [`Store::edit_selected`].
    pub fn delete_selected(
        &self,
        selector: &Selector,
        now: DateTime<Utc>,
    ) -> Result<TaskSetDiff, StoreError> {
        self.commit("delete", |tables, changes| {
            let targets = select_some(tables, selector, now)?;
            delete_each(tables, changes, &targets, now)
        })
    }

    pub fn get(&self, key: &TaskKey) -> Result<Option<Task>, StoreError> {
        Ok(self.read()?.get(key))
    }

    pub fn list(&self, filter: &TaskFilter, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        Ok(self.read()?.list(filter, now))
    }

    /// Revert the newest command.
    pub fn undo(&self) -> Result<TaskSetDiff, UndoError> {
        self.transaction(|tables| tables.undo(Utc::now()))
    }

    /// Renumber indices densely. Clears the journal.
    pub fn compact(&self) -> Result<Vec<(TaskIndex, TaskIndex)>, StoreError> {
        self.transaction(|tables| Ok(tables.compact()))
    }

    // -----------------------------------------------------------------------
    // File handling
    // -----------------------------------------------------------------------

    fn lock(&self, exclusive: bool) -> Result<File, StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
                set_dir_permissions(dir).map_err(|e| io_err(dir, e))?;
            }
        }
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;

        let started = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    let waited = started.elapsed();
                    if waited >= self.lock_wait {
                        return Err(StoreError::LockTimeout {
                            path: lock_path,
                            waited,
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(io_err(&lock_path, e)),
            }
        }
    }

    fn load(&self) -> Result<Tables, StoreError> {
        if !self.path.exists() {
            return Ok(Tables::default());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        let mut tables: Tables =
            serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        tables.rebuild_lookup();
        Ok(tables)
    }

    fn save(&self, tables: &Tables) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(tables)?;
        std::fs::write(&tmp_path, json).map_err(|e| io_err(&tmp_path, e))?;
        set_file_permissions(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn select_some(
    tables: &Tables,
    selector: &Selector,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, StoreError> {
    let targets = tables.select(selector, now)?;
    if targets.is_empty() {
        return Err(SelectorError::NoMatch.into());
    }
    Ok(targets)
}

fn edit_each(
    tables: &mut Tables,
    changes: &mut TaskSetDiff,
    targets: &[Task],
    request: &EditRequest,
) -> Result<(), StoreError> {
    for task in targets {
        let diff = tables.edit(task.index, request)?;
        let summary = tables
            .view(task.index)
            .map(|t| t.fields.summary)
            .unwrap_or_default();
        changes.push_update(tables.task_ref(task.index), summary, diff);
    }
    Ok(())
}

/// Mark each target deleted. Exposed for commands that delete as part of a
/// larger transaction, such as moving tasks between environments.
pub fn delete_each(
    tables: &mut Tables,
    changes: &mut TaskSetDiff,
    targets: &[Task],
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    for task in targets {
        let task_ref = tables.task_ref(task.index);
        let gone = tables.mark_deleted(task.index, now)?;
        changes.push(task_ref, TaskChange::Deleted { fields: gone.fields });
    }
    Ok(())
}
