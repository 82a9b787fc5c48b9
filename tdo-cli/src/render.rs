//! Terminal output: task tables and change summaries.

use chrono::{DateTime, Local, Utc};
use colored::Colorize;
use tabled::{
    settings::{location::ByColumnName, Disable, Style},
    Table, Tabled,
};

use tdo_core::{ConflictNotice, Task, TaskChange, TaskSetDiff};

const DESCRIPTION_WIDTH: usize = 45;

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Project")]
    project: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Due")]
    due: String,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Pri")]
    priority: String,
    #[tabled(rename = "UID")]
    uid: String,
}

pub fn print_tasks(tasks: &[Task], show_uids: bool, now: DateTime<Utc>) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    let rows: Vec<TaskRow> = tasks
        .iter()
        .map(|task| {
            let fields = &task.fields;
            let mut id = task.index.to_string();
            if task.dirty {
                id.push('*');
            }
            TaskRow {
                id,
                age: due_distance(fields.due, now),
                project: fields.project.clone().unwrap_or_else(|| "-".into()),
                tags: if fields.tags.is_empty() {
                    "-".into()
                } else {
                    fields.tags.iter().cloned().collect::<Vec<_>>().join(",")
                },
                due: fields
                    .due
                    .map(|d| d.with_timezone(&Local).format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "-".into()),
                description: truncate(&fields.summary, DESCRIPTION_WIDTH),
                priority: fields.priority.label().to_owned(),
                uid: task
                    .uid
                    .as_ref()
                    .map(|u| u.0.clone())
                    .unwrap_or_else(|| "(local)".into()),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    if !show_uids {
        table.with(Disable::column(ByColumnName::new("UID")));
    }
    println!("{table}");
    let unsynced = tasks.iter().filter(|t| t.dirty).count();
    if unsynced > 0 {
        println!("{}", format!("* {unsynced} with local changes not pushed").bright_black());
    }
}

/// Signed distance to the due instant: `3d`, `-5h`, `12m`, `--` when unset.
pub fn due_distance(due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(due) = due else {
        return "--".into();
    };
    let secs = (due - now).num_seconds();
    let sign = if secs < 0 { "-" } else { "" };
    let secs = secs.abs();
    if secs >= 86_400 {
        format!("{sign}{}d", secs / 86_400)
    } else if secs >= 3_600 {
        format!("{sign}{}h", secs / 3_600)
    } else {
        format!("{sign}{}m", secs / 60)
    }
}

pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_owned();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Grouped change listing; nothing for an empty set.
pub fn print_changes(changes: &TaskSetDiff) {
    if !changes.is_empty() {
        print!("{changes}");
    }
}

pub fn print_conflicts(conflicts: &[ConflictNotice]) {
    for notice in conflicts {
        println!("  {} {notice}", "!".yellow().bold());
    }
}
