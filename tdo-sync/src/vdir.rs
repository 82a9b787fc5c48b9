//! Directory-backed collection: one `.ics` file per task.
//!
//! New records are written to `<uid>.ics`. Files written by other clients
//! may be named anything; a record is located by the UID inside the file,
//! through the map the last listing built, then the default name, then a
//! scan of the directory.
//!
//! ## Write protocol
//!
//! 1. Encode the record.
//! 2. If the caller passed an etag, hash the current file and compare;
//!    mismatch → [`RemoteError::PreconditionFailed`].
//! 3. Write to `<file>.tdo.tmp`.
//! 4. Rename over `<file>` (atomic on POSIX).
//!
//! The etag of a record is the SHA-256 hex digest of its file bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use sha2::{Digest, Sha256};

use tdo_core::TaskUid;

use crate::error::{io_err, RemoteError};
use crate::ics;
use crate::remote::{PutReceipt, RemoteClient, RemoteTaskRecord};

#[derive(Debug)]
pub struct VdirRemote {
    dir: PathBuf,
    /// uid → file, as of the last listing or lookup.
    files: Mutex<HashMap<TaskUid, PathBuf>>,
}

/// A stored record: where it lives and what it holds.
struct Stored {
    path: PathBuf,
    bytes: Vec<u8>,
    record: RemoteTaskRecord,
}

impl VdirRemote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, uid: &TaskUid) -> PathBuf {
        self.dir.join(format!("{}.ics", file_stem(uid)))
    }

    fn remember(&self, uid: &TaskUid, path: &Path) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(uid.clone(), path.to_path_buf());
        }
    }

    fn forget(&self, uid: &TaskUid) {
        if let Ok(mut files) = self.files.lock() {
            files.remove(uid);
        }
    }

    fn remembered(&self, uid: &TaskUid) -> Option<PathBuf> {
        self.files.lock().ok()?.get(uid).cloned()
    }

    /// Find the file holding `uid`, or `None` if no file does.
    fn locate(&self, uid: &TaskUid) -> Result<Option<Stored>, RemoteError> {
        for path in self.remembered(uid).into_iter().chain([self.path_for(uid)]) {
            if let Some(stored) = read_stored(&path)? {
                if stored.record.uid.as_ref() == Some(uid) {
                    return Ok(Some(stored));
                }
            }
        }
        if !self.dir.is_dir() {
            return Ok(None);
        }
        for path in self.listing()? {
            if let Some(stored) = read_stored(&path)? {
                if stored.record.uid.as_ref() == Some(uid) {
                    self.remember(uid, &stored.path);
                    return Ok(Some(stored));
                }
            }
        }
        self.forget(uid);
        Ok(None)
    }

    fn listing(&self) -> Result<Vec<PathBuf>, RemoteError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "ics"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn ensure_dir(&self) -> Result<(), RemoteError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        if self.dir.exists() {
            return Err(RemoteError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))
    }
}

impl RemoteClient for VdirRemote {
    fn fetch_all(&self) -> Result<Vec<RemoteTaskRecord>, RemoteError> {
        if !self.dir.is_dir() {
            return Err(RemoteError::Unavailable(format!(
                "collection directory {} does not exist",
                self.dir.display()
            )));
        }
        let mut records = Vec::new();
        let mut files = HashMap::new();
        for path in self.listing()? {
            let Some(stored) = read_stored(&path)? else {
                continue;
            };
            let mut record = stored.record;
            record.etag = Some(etag_of(&stored.bytes));
            if let Some(uid) = &record.uid {
                files.insert(uid.clone(), stored.path);
            }
            records.push(record);
        }
        if let Ok(mut known) = self.files.lock() {
            *known = files;
        }
        tracing::debug!("fetched {} record(s) from {}", records.len(), self.dir.display());
        Ok(records)
    }

    fn put(&self, record: &RemoteTaskRecord) -> Result<PutReceipt, RemoteError> {
        self.ensure_dir()?;
        let uid = record.uid.clone().unwrap_or_else(TaskUid::generate);
        let existing = match &record.uid {
            Some(uid) => self.locate(uid)?,
            None => None,
        };

        let mut record = record.clone();
        let path = match &existing {
            Some(stored) => {
                let actual = etag_of(&stored.bytes);
                if record.etag.as_ref().is_some_and(|expected| *expected != actual) {
                    return Err(RemoteError::PreconditionFailed(uid));
                }
                record.keep_source_lines(&stored.record);
                stored.path.clone()
            }
            // An etag names a version that must still exist.
            None if record.uid.is_some() && record.etag.is_some() => {
                return Err(RemoteError::NotFound(uid));
            }
            None => self.path_for(&uid),
        };

        let content = ics::encode(&record, &uid, Utc::now());
        let tmp = PathBuf::from(format!("{}.tdo.tmp", path.display()));
        std::fs::write(&tmp, content.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        self.remember(&uid, &path);
        tracing::debug!("wrote: {}", path.display());
        Ok(PutReceipt {
            uid,
            etag: Some(etag_of(content.as_bytes())),
        })
    }

    fn delete(&self, uid: &TaskUid, etag: Option<&str>) -> Result<(), RemoteError> {
        let Some(stored) = self.locate(uid)? else {
            return Err(RemoteError::NotFound(uid.clone()));
        };
        if etag.is_some_and(|expected| expected != etag_of(&stored.bytes)) {
            return Err(RemoteError::PreconditionFailed(uid.clone()));
        }
        std::fs::remove_file(&stored.path).map_err(|e| io_err(&stored.path, e))?;
        self.forget(uid);
        tracing::debug!("removed: {}", stored.path.display());
        Ok(())
    }
}

/// Read and decode one file. `None` when it does not exist. Files without
/// a UID are addressed by their name.
fn read_stored(path: &Path) -> Result<Option<Stored>, RemoteError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    let codec = |message: String| RemoteError::Codec {
        path: path.to_path_buf(),
        message,
    };
    let text = std::str::from_utf8(&bytes).map_err(|e| codec(format!("not UTF-8: {e}")))?;
    let mut record = ics::decode(text).map_err(|e| codec(e.0))?;
    if record.uid.is_none() {
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        record.uid = stem.map(TaskUid);
    }
    Ok(Some(Stored {
        path: path.to_path_buf(),
        bytes,
        record,
    }))
}

fn etag_of(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// UIDs come from other clients too; keep only characters safe in a file name.
fn file_stem(uid: &TaskUid) -> String {
    uid.0
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
