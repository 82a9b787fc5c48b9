//! Append-only transaction log.
//!
//! Every local command commits one [`JournalEntry`] in the same store
//! transaction as the mutation itself. `undo` inverts the newest entry and
//! records the reversal as a new entry whose `undoes` points back at it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::TaskSetDiff;
use crate::error::UndoError;

/// Oldest entries are pruned beyond this many.
pub const MAX_ENTRIES: usize = 64;

/// One committed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    /// Command that produced the entry (`add`, `modify`, `undo`, …).
    pub operation: String,
    pub diff: TaskSetDiff,
    /// Sequence number of the entry this one reverted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undoes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default)]
    next_seq: u64,
    #[serde(default)]
    entries: VecDeque<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number. Empty diffs are not
    /// recorded unless the entry is an undo, which always marks the log.
    pub fn append(
        &mut self,
        operation: impl Into<String>,
        diff: TaskSetDiff,
        undoes: Option<u64>,
        at: DateTime<Utc>,
    ) -> Option<u64> {
        if diff.is_empty() && undoes.is_none() {
            return None;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries.push_back(JournalEntry {
            seq,
            at,
            operation: operation.into(),
            diff,
            undoes,
        });
        while self.entries.len() > MAX_ENTRIES {
            self.entries.pop_front();
        }
        Some(seq)
    }

    pub fn last(&self) -> Option<&JournalEntry> {
        self.entries.back()
    }

    /// The entry `undo` would revert. Undo is single-level: an undo entry
    /// on top of the log leaves nothing to undo.
    pub fn undo_target(&self) -> Result<&JournalEntry, UndoError> {
        match self.last() {
            Some(entry) if entry.undoes.is_none() => Ok(entry),
            _ => Err(UndoError::NothingToUndo),
        }
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry; sequence numbers keep increasing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
