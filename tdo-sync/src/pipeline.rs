//! Pull, push and sync against a [`RemoteClient`].
//!
//! ## Pull
//!
//! 1. `fetch_all` on the blocking pool, under the request timeout. Any error
//!    aborts here; the store is not touched.
//! 2. One store transaction: reconcile every record, then tombstone what the
//!    listing no longer contains.
//!
//! ## Push
//!
//! 1. Decision phase: one locked snapshot of the pending operations.
//! 2. Network phase: operations run concurrently, bounded by a semaphore.
//! 3. Each success is confirmed in its own store transaction as soon as it
//!    lands, so an interrupted push keeps what already went through.
//!
//! A failure of one operation (remote refusal, timeout, worker panic, or a
//! confirm transaction that cannot commit) is recorded as a [`PushFailure`]
//! and the remaining operations still run. Creates carry the uid minted when
//! the task was added, so a create that landed after a timeout is not
//! duplicated by the retry.
//!
//! Neither phase writes journal entries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use tdo_core::env::{DEFAULT_PUSH_CONCURRENCY, DEFAULT_TIMEOUT_SECS};
use tdo_core::{
    ConflictNotice, EnvConfig, PushOp, ReconcileOutcome, Store, StoreError, TaskChange, TaskIndex,
    TaskRef, TaskSetDiff,
};

use crate::error::{PushError, RemoteError, SyncError};
use crate::remote::{PutReceipt, RemoteClient, RemoteTaskRecord};

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound on remote writes in flight.
    pub push_concurrency: usize,
    /// Per-call remote timeout.
    pub timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            push_concurrency: DEFAULT_PUSH_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl From<&EnvConfig> for SyncOptions {
    fn from(config: &EnvConfig) -> Self {
        Self {
            push_concurrency: config.push_concurrency.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// What a pull changed locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub fetched: usize,
    pub diff: TaskSetDiff,
    pub conflicts: Vec<ConflictNotice>,
}

/// One pending operation that did not go through.
#[derive(Debug)]
pub struct PushFailure {
    pub task: TaskRef,
    pub error: PushError,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failures: Vec<PushFailure>,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn pushed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub pull: PullReport,
    pub push: PushReport,
}

// ---------------------------------------------------------------------------
// Entrypoints
// ---------------------------------------------------------------------------

/// Mirror the remote collection into `store`.
pub async fn pull(
    store: &Store,
    remote: Arc<dyn RemoteClient>,
    options: &SyncOptions,
) -> Result<PullReport, SyncError> {
    let records = blocking(options.timeout, move || remote.fetch_all()).await??;
    let fetched = records.len();
    let now = Utc::now();

    let report = store.transaction(|tables| {
        let mut diff = TaskSetDiff::new();
        let mut conflicts = Vec::new();
        let mut seen = BTreeSet::new();
        for record in records {
            let Some(uid) = record.uid.clone() else {
                tracing::warn!("skipping remote record without a UID: {}", record.summary);
                continue;
            };
            seen.insert(uid.clone());
            let fields = record.to_fields();
            match tables.reconcile_from_remote(&uid, fields.clone(), record.etag, now) {
                ReconcileOutcome::Created { index } => {
                    tracing::debug!("pull: new task {uid} at {index}");
                    diff.push(TaskRef::new(index, Some(uid)), TaskChange::Created { fields });
                }
                ReconcileOutcome::Updated {
                    index,
                    diff: changed,
                    conflicts: found,
                } => {
                    tracing::debug!("pull: {uid} changed ({} field(s))", changed.len());
                    let summary = tables
                        .view(index)
                        .map(|t| t.fields.summary)
                        .unwrap_or_default();
                    diff.push_update(TaskRef::new(index, Some(uid)), summary, changed);
                    conflicts.extend(found);
                }
                ReconcileOutcome::Unchanged { .. } | ReconcileOutcome::Skipped => {}
            }
        }
        let (removed, lost) = tables.tombstone_missing(&seen, now);
        diff.extend(removed);
        conflicts.extend(lost);
        tables.pulled_at = Some(now);
        Ok::<_, StoreError>(PullReport {
            fetched,
            diff,
            conflicts,
        })
    })?;

    tracing::info!(
        "pull: fetched {}, {} new, {} updated, {} removed, {} conflict(s)",
        report.fetched,
        report.diff.created(),
        report.diff.updated(),
        report.diff.deleted(),
        report.conflicts.len()
    );
    Ok(report)
}

/// Send every pending local change to the remote.
pub async fn push(
    store: &Store,
    remote: Arc<dyn RemoteClient>,
    options: &SyncOptions,
) -> Result<PushReport, SyncError> {
    let operations = store.read()?.pending_operations();
    let mut report = PushReport::default();
    if operations.is_empty() {
        tracing::info!("push: nothing to send");
        return Ok(report);
    }

    let semaphore = Arc::new(Semaphore::new(options.push_concurrency.max(1)));
    let mut outstanding: BTreeMap<TaskIndex, TaskRef> = operations
        .iter()
        .map(|op| (op.index(), op.task_ref()))
        .collect();
    let mut in_flight = JoinSet::new();
    for op in operations {
        let semaphore = semaphore.clone();
        let remote = remote.clone();
        let timeout = options.timeout;
        in_flight.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => send(remote, &op, timeout).await,
                Err(_) => Err(RemoteError::Unavailable("push cancelled".into()).into()),
            };
            (op, result)
        });
    }

    let mut lost_workers = Vec::new();
    while let Some(joined) = in_flight.join_next().await {
        let (op, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!("push: worker failed: {err}");
                lost_workers.push(err.to_string());
                continue;
            }
        };
        outstanding.remove(&op.index());
        let outcome = match result {
            Ok(receipt) => confirm(store, &op, receipt, &mut report).map_err(PushError::from),
            Err(error) => Err(error),
        };
        if let Err(error) = outcome {
            tracing::warn!("push: {} failed: {error}", op.task_ref());
            report.failures.push(PushFailure {
                task: op.task_ref(),
                error,
            });
        }
    }
    // Workers that died without handing back their operation.
    let reason = lost_workers.join("; ");
    for task in outstanding.into_values() {
        report.failures.push(PushFailure {
            task,
            error: PushError::Worker(reason.clone()),
        });
    }

    let stamped = store.transaction(|tables| {
        tables.pushed_at = Some(Utc::now());
        Ok::<_, StoreError>(())
    });
    if let Err(err) = stamped {
        tracing::warn!("push: could not record the push time: {err}");
    }
    tracing::info!(
        "push: {} created, {} updated, {} deleted, {} failed",
        report.created,
        report.updated,
        report.deleted,
        report.failures.len()
    );
    Ok(report)
}

/// Pull, then push. A failed pull stops before anything is sent.
pub async fn sync(
    store: &Store,
    remote: Arc<dyn RemoteClient>,
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    let pull = pull(store, remote.clone(), options).await?;
    let push = push(store, remote, options).await?;
    Ok(SyncReport { pull, push })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run a blocking remote call off the runtime, bounded by `timeout`.
async fn blocking<T, F>(timeout: Duration, f: F) -> Result<Result<T, RemoteError>, JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(joined) => joined,
        Err(_) => Ok(Err(RemoteError::Timeout(timeout))),
    }
}

/// Perform one operation. `None` means a delete went through.
async fn send(
    remote: Arc<dyn RemoteClient>,
    op: &PushOp,
    timeout: Duration,
) -> Result<Option<PutReceipt>, PushError> {
    let outcome = match op.clone() {
        PushOp::Create { uid, fields, .. } => {
            let record = RemoteTaskRecord::from_fields(Some(uid), None, &fields);
            blocking(timeout, move || remote.put(&record).map(Some)).await
        }
        PushOp::Update {
            uid, fields, etag, ..
        } => {
            let record = RemoteTaskRecord::from_fields(Some(uid), etag, &fields);
            blocking(timeout, move || remote.put(&record).map(Some)).await
        }
        PushOp::Delete { uid, etag, .. } => {
            blocking(timeout, move || match remote.delete(&uid, etag.as_deref()) {
                // Already gone remotely: the delete is satisfied.
                Ok(()) | Err(RemoteError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            })
            .await
        }
    };
    match outcome {
        Ok(result) => Ok(result?),
        Err(join) => Err(PushError::Worker(join.to_string())),
    }
}

fn confirm(
    store: &Store,
    op: &PushOp,
    receipt: Option<PutReceipt>,
    report: &mut PushReport,
) -> Result<(), StoreError> {
    let now = Utc::now();
    store.transaction(|tables| {
        match (op, receipt) {
            (PushOp::Create { index, fields, .. }, Some(receipt)) => {
                let index = tables.confirm_create(*index, fields, receipt.uid.clone(), receipt.etag, now);
                tracing::debug!("push: created {} at {index}", receipt.uid);
                report.created += 1;
            }
            (PushOp::Update { uid, fields, .. }, Some(receipt)) => {
                tables.confirm_update(uid, fields, receipt.etag, now);
                tracing::debug!("push: updated {uid}");
                report.updated += 1;
            }
            (PushOp::Delete { uid, .. }, _) => {
                tables.confirm_delete(uid, now);
                tracing::debug!("push: deleted {uid}");
                report.deleted += 1;
            }
            (op, None) => tracing::warn!("push: no receipt for {}", op.task_ref()),
        }
        Ok(())
    })
}
