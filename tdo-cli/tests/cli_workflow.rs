use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn tdo(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tdo"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("TDO_ENV")
        .env_remove("TDO_CONFIG_FILE")
        .env_remove("TDO_TASK_CACHE_FILE")
        .env_remove("TDO_CALENDAR")
        .env_remove("TDO_LOG");
    cmd
}

fn run(home: &Path, args: &[&str]) -> String {
    let assert = tdo(home).args(args).assert().success();
    String::from_utf8(assert.get_output().stdout.clone()).expect("stdout utf8")
}

#[test]
fn add_then_list_shows_task() {
    let home = TempDir::new().unwrap();
    tdo(home.path())
        .args(["add", "Buy", "milk", "+errand", "pri:H"])
        .assert()
        .success()
        .stdout(contains("Created task 1: Buy milk"));

    let listing = run(home.path(), &["list"]);
    assert!(listing.contains("Buy milk"), "{listing}");
    assert!(listing.contains("errand"), "{listing}");
    assert!(!listing.contains("UID"), "UID column is opt-in:\n{listing}");
}

#[test]
fn list_json_emits_task_fields() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Write", "report", "project:work"]);
    tdo(home.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(contains("\"summary\": \"Write report\""))
        .stdout(contains("\"project\": \"work\""))
        .stdout(contains("\"index\": 1"));
}

#[test]
fn modify_then_undo_restores_previous_value() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Fix", "bug", "pri:H"]);
    tdo(home.path())
        .args(["modify", "1", "pri:L"])
        .assert()
        .success()
        .stdout(contains("priority"));

    run(home.path(), &["undo"]);
    tdo(home.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout(contains("\"priority\": \"high\""));
}

#[test]
fn second_undo_reports_nothing_to_undo() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "One"]);
    run(home.path(), &["undo"]);
    tdo(home.path())
        .arg("undo")
        .assert()
        .failure()
        .stderr(contains("nothing to undo"));
}

#[test]
fn unknown_index_is_reported_without_failing() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Only", "task"]);
    tdo(home.path())
        .args(["do", "42"])
        .assert()
        .success()
        .stdout(contains("no task with index 42"));
}

#[test]
fn malformed_time_fails_with_token() {
    let home = TempDir::new().unwrap();
    tdo(home.path())
        .args(["add", "Pay", "rent", "due:notatime"])
        .assert()
        .failure()
        .stderr(contains("due:notatime"));
}

#[test]
fn do_hides_task_from_default_listing() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "First"]);
    run(home.path(), &["add", "Second"]);
    run(home.path(), &["do", "1"]);

    let listing = run(home.path(), &["list"]);
    assert!(!listing.contains("First"), "{listing}");
    assert!(listing.contains("Second"), "{listing}");

    let everything = run(home.path(), &["list", "status:any"]);
    assert!(everything.contains("First"), "{everything}");
}

#[test]
fn waiting_tasks_are_listed_separately() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Read", "book", "wait:someday"]);
    run(home.path(), &["add", "Call", "mom"]);

    let listing = run(home.path(), &["list"]);
    assert!(!listing.contains("Read book"), "{listing}");
    let waiting = run(home.path(), &["waiting"]);
    assert!(waiting.contains("Read book"), "{waiting}");
    assert!(!waiting.contains("Call mom"), "{waiting}");
}

#[test]
fn history_lists_commands_newest_first() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "A"]);
    run(home.path(), &["modify", "1", "+x"]);
    let history = run(home.path(), &["history"]);
    let modify = history.find("modify").expect("modify entry");
    let add = history.find("add").expect("add entry");
    assert!(modify < add, "{history}");
}

#[test]
fn config_init_refuses_to_overwrite() {
    let home = TempDir::new().unwrap();
    let calendar = TempDir::new().unwrap();
    let cal = calendar.path().to_str().unwrap();
    run(home.path(), &["config", "init", "--calendar", cal]);
    assert!(home.path().join(".config/tdo/config.default.yaml").exists());

    tdo(home.path())
        .args(["config", "init", "--calendar", cal])
        .assert()
        .failure()
        .stderr(contains("--force"));
    run(home.path(), &["config", "init", "--calendar", cal, "--force"]);

    tdo(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains(cal))
        .stdout(contains("push_concurrency: 4"));
}

#[test]
fn push_without_remote_explains_setup() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Something"]);
    tdo(home.path())
        .arg("push")
        .assert()
        .failure()
        .stderr(contains("no remote configured"));
}

#[test]
fn sync_round_trip_through_calendar_directory() {
    let home = TempDir::new().unwrap();
    let calendar = TempDir::new().unwrap();
    let cal = calendar.path().to_str().unwrap();
    run(home.path(), &["config", "init", "--calendar", cal, "--show-uids"]);
    run(home.path(), &["add", "Plan", "trip", "x:X-APPLE-SORT-ORDER:7"]);

    tdo(home.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(contains("Pushed 1"));

    let files: Vec<_> = std::fs::read_dir(calendar.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let ics = std::fs::read_to_string(&files[0]).unwrap();
    assert!(ics.contains("SUMMARY:Plan trip"), "{ics}");
    assert!(ics.contains("X-APPLE-SORT-ORDER:7"), "{ics}");

    tdo(home.path())
        .arg("sync")
        .assert()
        .success()
        .stdout(contains("Nothing to push"));
    let listing = run(home.path(), &["list"]);
    assert!(listing.contains("UID"), "{listing}");
    assert!(!listing.contains("(local)"), "{listing}");
}

#[test]
fn calendar_override_from_environment() {
    let home = TempDir::new().unwrap();
    let calendar = TempDir::new().unwrap();
    run(home.path(), &["add", "Via", "env"]);
    tdo(home.path())
        .env("TDO_CALENDAR", calendar.path())
        .arg("push")
        .assert()
        .success()
        .stdout(contains("1 created"));
    assert_eq!(std::fs::read_dir(calendar.path()).unwrap().count(), 1);
}

#[test]
fn move_between_environments() {
    let home = TempDir::new().unwrap();
    run(home.path(), &["add", "Portable", "task"]);
    tdo(home.path())
        .args(["move", "work", "1"])
        .assert()
        .success()
        .stdout(contains("Moved 1 task(s) from 'default' to 'work'"));

    let here = run(home.path(), &["list"]);
    assert!(!here.contains("Portable task"), "{here}");
    tdo(home.path())
        .args(["--env", "work", "list"])
        .assert()
        .success()
        .stdout(contains("Portable task"));
}

#[test]
fn env_variable_selects_environment() {
    let home = TempDir::new().unwrap();
    tdo(home.path())
        .env("TDO_ENV", "side")
        .args(["add", "Side", "project"])
        .assert()
        .success();
    assert!(home.path().join(".cache/tdo/side/tasks.json").exists());
    tdo(home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(contains("Side project").not());
}

#[test]
fn cache_file_override_is_honoured() {
    let home = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let store = elsewhere.path().join("tasks.json");
    tdo(home.path())
        .env("TDO_TASK_CACHE_FILE", &store)
        .args(["add", "Elsewhere"])
        .assert()
        .success();
    assert!(store.exists());
    assert!(!home.path().join(".cache/tdo/default/tasks.json").exists());
}

#[test]
fn compact_renumbers_after_deletion() {
    let home = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        run(home.path(), &["add", name]);
    }
    run(home.path(), &["del", "2"]);
    tdo(home.path())
        .arg("compact")
        .assert()
        .success()
        .stdout(contains("3 → 2"));
    tdo(home.path())
        .arg("undo")
        .assert()
        .failure()
        .stderr(contains("nothing to undo"));
}

#[test]
fn invalid_env_name_is_rejected() {
    let home = TempDir::new().unwrap();
    tdo(home.path())
        .args(["--env", "../etc", "list"])
        .assert()
        .failure()
        .stderr(contains("invalid environment name"));
}
