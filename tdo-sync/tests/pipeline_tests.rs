//! Pipeline tests against an in-memory remote with failure injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use tdo_core::request::{EditRequest, FieldEdit, TaskFilter};
use tdo_core::{EnvName, Priority, Store, TaskFields, TaskIndex, TaskKey, TaskUid};
use tdo_sync::{
    pull, push, sync, PushError, PutReceipt, RemoteClient, RemoteError, RemoteTaskRecord,
    SyncError, SyncOptions, VdirRemote,
};

// ---------------------------------------------------------------------------
// Fake remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    records: BTreeMap<TaskUid, RemoteTaskRecord>,
    version: u32,
    fail_fetch: bool,
    fail_summaries: BTreeSet<String>,
    panic_summaries: BTreeSet<String>,
    delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
    puts: Vec<RemoteTaskRecord>,
}

#[derive(Clone, Default)]
struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn seed(&self, uid: &str, record: RemoteTaskRecord) {
        self.with(|s| {
            s.version += 1;
            let record = RemoteTaskRecord {
                uid: Some(TaskUid::from(uid)),
                etag: Some(format!("e{}", s.version)),
                ..record
            };
            s.records.insert(TaskUid::from(uid), record);
        });
    }

    fn remove(&self, uid: &str) {
        self.with(|s| s.records.remove(&TaskUid::from(uid)));
    }

    fn client(&self) -> Arc<dyn RemoteClient> {
        Arc::new(self.clone())
    }

    fn enter(&self) {
        self.with(|s| {
            s.in_flight += 1;
            s.max_in_flight = s.max_in_flight.max(s.in_flight);
        });
        let delay = self.with(|s| s.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn leave(&self) {
        self.with(|s| s.in_flight -= 1);
    }
}

impl RemoteClient for FakeRemote {
    fn fetch_all(&self) -> Result<Vec<RemoteTaskRecord>, RemoteError> {
        self.with(|s| {
            if s.fail_fetch {
                return Err(RemoteError::Unavailable("injected fetch failure".into()));
            }
            Ok(s.records.values().cloned().collect())
        })
    }

    fn put(&self, record: &RemoteTaskRecord) -> Result<PutReceipt, RemoteError> {
        if self.with(|s| s.panic_summaries.contains(&record.summary)) {
            panic!("injected put panic");
        }
        self.enter();
        let result = self.with(|s| {
            if s.fail_summaries.contains(&record.summary) {
                return Err(RemoteError::Unavailable("injected put failure".into()));
            }
            s.version += 1;
            let uid = record
                .uid
                .clone()
                .unwrap_or_else(|| TaskUid(format!("r{}", s.version)));
            if let (Some(expected), Some(stored)) = (&record.etag, s.records.get(&uid)) {
                if stored.etag.as_ref() != Some(expected) {
                    return Err(RemoteError::PreconditionFailed(uid));
                }
            }
            let etag = Some(format!("e{}", s.version));
            let stored = RemoteTaskRecord {
                uid: Some(uid.clone()),
                etag: etag.clone(),
                ..record.clone()
            };
            s.puts.push(stored.clone());
            s.records.insert(uid.clone(), stored);
            Ok(PutReceipt { uid, etag })
        });
        self.leave();
        result
    }

    fn delete(&self, uid: &TaskUid, _etag: Option<&str>) -> Result<(), RemoteError> {
        self.with(|s| match s.records.remove(uid) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(uid.clone())),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn store(home: &TempDir) -> Store {
    Store::open_at(home.path(), &EnvName::from("test"))
}

fn record(summary: &str) -> RemoteTaskRecord {
    RemoteTaskRecord {
        summary: summary.into(),
        ..RemoteTaskRecord::default()
    }
}

fn edit(store: &Store, index: u32, edits: &[FieldEdit]) {
    let task = store
        .get(&TaskKey::Index(TaskIndex(index)))
        .unwrap()
        .expect("task exists");
    let request: EditRequest = edits.iter().cloned().collect();
    store.edit("modify", &[task], &request).expect("edit");
}

fn visible(store: &Store) -> Vec<String> {
    store
        .list(&TaskFilter::visible(), Utc::now())
        .unwrap()
        .into_iter()
        .map(|t| t.fields.summary)
        .collect()
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pull_mirrors_remote_and_keeps_indices() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.seed("u1", record("Fix bug"));
    fake.seed("u2", record("Write docs"));

    let report = pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.diff.created(), 2);

    fake.seed("u1", record("Fix the bug"));
    let report = pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.diff.created(), 0);
    assert_eq!(report.diff.updated(), 1);

    let task = store
        .get(&TaskKey::Uid(TaskUid::from("u1")))
        .unwrap()
        .unwrap();
    assert_eq!(task.index, TaskIndex(1));
    assert_eq!(task.fields.summary, "Fix the bug");
    assert!(store.read().unwrap().journal.is_empty());
}

#[tokio::test]
async fn failed_fetch_leaves_store_untouched() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.with(|s| s.fail_fetch = true);

    let err = pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Remote(RemoteError::Unavailable(_))));
    assert!(!store.path().exists());
}

#[tokio::test]
async fn task_missing_from_listing_is_tombstoned() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.seed("u1", record("Fix bug"));
    fake.seed("u2", record("Write docs"));
    pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();

    fake.remove("u2");
    let report = pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.diff.deleted(), 1);
    assert_eq!(visible(&store), vec!["Fix bug"]);

    let tables = store.read().unwrap();
    assert!(tables.tombstone(&TaskUid::from("u2")).is_some());
    assert_eq!(tables.index_of(&TaskUid::from("u1")), Some(TaskIndex(1)));
}

#[tokio::test]
async fn remote_deletion_drops_local_edits_with_notice() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.seed("u1", record("Fix bug"));
    pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    edit(&store, 1, &[FieldEdit::Priority(Priority::High)]);

    fake.remove("u1");
    let report = pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert!(report.conflicts[0].to_string().contains("deleted remotely"));
    assert!(store.read().unwrap().pending_operations().is_empty());
}

#[tokio::test]
async fn both_sides_changed_keeps_local_value() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.seed("u1", record("Fix bug"));
    pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    edit(&store, 1, &[FieldEdit::Priority(Priority::High)]);

    fake.seed(
        "u1",
        RemoteTaskRecord {
            priority: Priority::Low,
            ..record("Fix bug")
        },
    );
    let report = sync(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.pull.conflicts.len(), 1);
    assert_eq!(report.push.updated, 1);
    assert!(report.push.is_clean());

    let pushed = fake.with(|s| s.records[&TaskUid::from("u1")].clone());
    assert_eq!(pushed.priority, Priority::High);
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_properties_survive_push() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    let mut seeded = record("Plan trip");
    seeded
        .properties
        .insert("X-APPLE-SORT-ORDER".into(), "10".into());
    seeded.properties.insert("X-PROJECT".into(), "home".into());
    fake.seed("u1", seeded);
    pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();

    edit(&store, 1, &[FieldEdit::Priority(Priority::High)]);
    let report = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.updated, 1);

    let put = fake.with(|s| s.puts.last().cloned()).unwrap();
    assert_eq!(put.priority, Priority::High);
    assert_eq!(put.properties["X-APPLE-SORT-ORDER"], "10");
    assert_eq!(put.properties["X-PROJECT"], "home");
    assert!(store.read().unwrap().pending_operations().is_empty());
}

#[tokio::test]
async fn one_failure_does_not_block_the_rest() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.with(|s| s.fail_summaries.insert("bad".into()));
    for summary in ["first", "bad", "second"] {
        store.create(TaskFields::with_summary(summary)).unwrap();
    }

    let report = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task.index, TaskIndex(2));

    let tables = store.read().unwrap();
    let left = tables.pending_operations();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].index(), TaskIndex(2));
    // Pushed tasks keep the index they were created with.
    assert!(tables.view(TaskIndex(1)).unwrap().uid.is_some());
    assert!(tables.view(TaskIndex(3)).unwrap().uid.is_some());
}

#[tokio::test]
async fn delete_of_already_removed_task_succeeds() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.seed("u1", record("Fix bug"));
    pull(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    let task = store
        .get(&TaskKey::Index(TaskIndex(1)))
        .unwrap()
        .unwrap();
    store.delete(&[task]).unwrap();

    fake.remove("u1");
    let report = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(report.is_clean());
    assert!(store.read().unwrap().pending_operations().is_empty());
}

#[tokio::test]
async fn slow_remote_times_out_per_task() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.with(|s| s.delay = Duration::from_millis(300));
    store.create(TaskFields::with_summary("slow")).unwrap();

    let options = SyncOptions {
        timeout: Duration::from_millis(20),
        ..SyncOptions::default()
    };
    let report = push(&store, fake.client(), &options).await.unwrap();
    assert_eq!(report.created, 0);
    assert!(matches!(
        report.failures[0].error,
        PushError::Remote(RemoteError::Timeout(_))
    ));
    assert_eq!(store.read().unwrap().pending_operations().len(), 1);
}

#[tokio::test]
async fn panicking_worker_is_recorded_and_the_rest_confirmed() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.with(|s| s.panic_summaries.insert("boom".into()));
    for summary in ["first", "boom", "second"] {
        store.create(TaskFields::with_summary(summary)).unwrap();
    }

    let report = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].task.index, TaskIndex(2));
    assert!(matches!(report.failures[0].error, PushError::Worker(_)));

    let tables = store.read().unwrap();
    assert!(tables.pushed_at.is_some());
    assert_eq!(tables.pending_operations().len(), 1);
}

#[tokio::test]
async fn unrecorded_create_is_retried_without_duplicating() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    store.create(TaskFields::with_summary("one")).unwrap();
    store.create(TaskFields::with_summary("two")).unwrap();

    // A directory where the store writes its temp file makes every save fail.
    let jam = store.path().with_extension("json.tmp");
    std::fs::create_dir_all(&jam).unwrap();
    let report = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .all(|f| matches!(f.error, PushError::Confirm(_))));
    assert_eq!(fake.with(|s| s.records.len()), 2);

    std::fs::remove_dir(&jam).unwrap();
    let retry = push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(retry.created, 2);
    assert!(retry.is_clean());
    assert_eq!(fake.with(|s| s.records.len()), 2);

    let uids: BTreeSet<_> = fake.with(|s| s.records.keys().cloned().collect());
    let tables = store.read().unwrap();
    for index in [TaskIndex(1), TaskIndex(2)] {
        let uid = tables.view(index).unwrap().uid.unwrap();
        assert!(uids.contains(&uid), "{uid} not on the remote");
    }
}

#[tokio::test]
async fn pull_adopts_a_create_that_already_landed() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    store.create(TaskFields::with_summary("landed")).unwrap();

    let jam = store.path().with_extension("json.tmp");
    std::fs::create_dir_all(&jam).unwrap();
    push(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    std::fs::remove_dir(&jam).unwrap();

    let report = sync(&store, fake.client(), &SyncOptions::default())
        .await
        .unwrap();
    assert!(report.pull.diff.is_empty(), "{:?}", report.pull.diff);
    assert_eq!(report.push.pushed(), 0);
    let tables = store.read().unwrap();
    assert!(tables.view(TaskIndex(1)).unwrap().uid.is_some());
    assert!(tables.view(TaskIndex(2)).is_none());
    assert!(tables.pending_operations().is_empty());
    assert_eq!(fake.with(|s| s.records.len()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_respects_concurrency_bound() {
    init_logging();
    let home = TempDir::new().unwrap();
    let store = store(&home);
    let fake = FakeRemote::default();
    fake.with(|s| s.delay = Duration::from_millis(30));
    for n in 0..6 {
        store
            .create(TaskFields::with_summary(format!("task {n}")))
            .unwrap();
    }

    let options = SyncOptions {
        push_concurrency: 2,
        ..SyncOptions::default()
    };
    let report = push(&store, fake.client(), &options).await.unwrap();
    assert_eq!(report.created, 6);
    let max = fake.with(|s| s.max_in_flight);
    assert!((1..=2).contains(&max), "max in flight: {max}");
}

// ---------------------------------------------------------------------------
// Vdir end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_against_vdir_is_idempotent() {
    init_logging();
    let home = TempDir::new().unwrap();
    let calendar = TempDir::new().unwrap();
    let store = store(&home);
    let remote: Arc<dyn RemoteClient> = Arc::new(VdirRemote::new(calendar.path()));

    let mut fields = TaskFields::with_summary("Buy milk");
    fields.x_properties.insert("X-APPLE-SORT-ORDER", "3");
    store.create(fields).unwrap();

    let first = sync(&store, remote.clone(), &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(first.push.created, 1);
    let files = std::fs::read_dir(calendar.path()).unwrap().count();
    assert_eq!(files, 1);

    let second = sync(&store, remote, &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(second.pull.fetched, 1);
    assert!(second.pull.diff.is_empty(), "{:?}", second.pull.diff);
    assert_eq!(second.push.pushed(), 0);

    let task = store
        .get(&TaskKey::Index(TaskIndex(1)))
        .unwrap()
        .unwrap();
    assert!(task.uid.is_some());
    assert!(!task.dirty);
    assert_eq!(task.fields.x_properties.get("X-APPLE-SORT-ORDER"), Some("3"));
}
