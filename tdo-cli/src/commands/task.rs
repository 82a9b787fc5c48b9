//! Local task commands: `add`, `modify`, `do`, `start`, `stop`, `del`, `move`.
//!
//! Every command here is one store transaction and one journal entry.
//! Nothing talks to the remote; `push` or `sync` sends the changes later.

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use clap::Args;

use tdo_core::store::delete_each;
use tdo_core::{
    EnvName, MutationRequest, Selector, SelectorError, Status, StoreError, Task, TaskChange,
    TaskSetDiff,
};
use tdo_parser::Mode;

use crate::context::{now, Context};
use crate::render::print_changes;

/// Free-form tokens: words, `+tag`, `-tag`, `key:value`.
#[derive(Args, Debug)]
pub struct TokenArgs {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "TOKENS")]
    pub tokens: Vec<String>,
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

impl TokenArgs {
    pub fn add(self, ctx: &Context) -> Result<()> {
        let request = tdo_parser::parse(&self.tokens, Mode::Add, now())?;
        let MutationRequest::Create(fields) = request else {
            bail!("`add` did not produce a new task");
        };
        let summary = fields.summary.clone();
        let (index, _) = ctx
            .store()
            .create(fields)
            .context("failed to add task")?;
        println!("✓ Created task {index}: {summary}");
        Ok(())
    }

    pub fn modify(self, ctx: &Context) -> Result<()> {
        let request = tdo_parser::parse(&self.tokens, Mode::Modify, now())?;
        apply(ctx, "modify", request)
    }

    pub fn set_status(self, ctx: &Context, operation: &str, status: Status) -> Result<()> {
        let request = tdo_parser::status_change(&self.tokens, status, now())?;
        apply(ctx, operation, request)
    }

    pub fn delete(self, ctx: &Context) -> Result<()> {
        let request = tdo_parser::delete(&self.tokens, now())?;
        apply(ctx, "delete", request)
    }
}

fn apply(ctx: &Context, operation: &str, request: MutationRequest) -> Result<()> {
    let store = ctx.store();
    let now = Utc::now();
    let outcome = match request {
        MutationRequest::Edit { selector, edits } => {
            store.edit_selected(operation, &selector, &edits, now)
        }
        MutationRequest::Delete(selector) => store.delete_selected(&selector, now),
        MutationRequest::Create(_) => bail!("`{operation}` cannot create tasks"),
    };
    let Some(changes) = reported(outcome).with_context(|| format!("{operation} failed"))? else {
        return Ok(());
    };

    if changes.is_empty() {
        println!("Nothing changed.");
    } else {
        println!("✓ {} {} task(s)", past_tense(operation), changes.len());
        print_changes(&changes);
    }
    Ok(())
}

/// Resolve `selector` against the store. A selector that matches nothing is
/// reported and yields `None`; it is not an error.
pub(crate) fn select(ctx: &Context, selector: &Selector) -> Result<Option<Vec<Task>>> {
    let tables = ctx.store().read().context("failed to read task store")?;
    match tables.select(selector, Utc::now()) {
        Ok(tasks) if tasks.is_empty() => {
            println!("No tasks selected.");
            Ok(None)
        }
        Ok(tasks) => Ok(Some(tasks)),
        Err(err) => {
            println!("{err}");
            Ok(None)
        }
    }
}

/// A selector that matched nothing is printed and is not an error.
fn reported<T>(outcome: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::Selector(err)) => {
            println!("{err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn past_tense(operation: &str) -> &'static str {
    match operation {
        "do" => "Completed",
        "start" => "Started",
        "stop" => "Stopped",
        "delete" => "Deleted",
        _ => "Modified",
    }
}

// ---------------------------------------------------------------------------
// move
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct MoveArgs {
    /// Environment to move the tasks into.
    pub target: String,

    /// Which tasks to move (indices or filter tokens). Defaults to the visible list.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "SELECTOR")]
    pub selector: Vec<String>,
}

impl MoveArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let target = ctx.sibling(EnvName::from(self.target))?;
        if target.store_path == ctx.store_path {
            bail!("source and target environment are the same ('{}')", ctx.env);
        }
        let selector = tdo_parser::parse_selector(&self.selector, now())?;
        let destination = target.store();
        let now = Utc::now();

        // The source stays locked while the copies are written, so the
        // selection cannot shift underneath the move.
        let mut created = TaskSetDiff::new();
        let outcome = ctx.store().commit("move", |tables, changes| {
            let tasks = tables.select(&selector, now)?;
            if tasks.is_empty() {
                return Err(StoreError::from(SelectorError::NoMatch));
            }
            created = destination.commit("move", |dest, added| {
                for task in &tasks {
                    let index = dest.create(task.fields.clone());
                    added.push(
                        dest.task_ref(index),
                        TaskChange::Created {
                            fields: task.fields.clone(),
                        },
                    );
                }
                Ok::<_, StoreError>(())
            })?;
            delete_each(tables, changes, &tasks, now)
        });
        if reported(outcome)
            .with_context(|| format!("failed to move tasks to env '{}'", target.env))?
            .is_none()
        {
            return Ok(());
        }

        println!(
            "✓ Moved {} task(s) from '{}' to '{}'",
            created.len(),
            ctx.env,
            target.env
        );
        print_changes(&created);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_tense_covers_journal_operations() {
        assert_eq!(past_tense("do"), "Completed");
        assert_eq!(past_tense("delete"), "Deleted");
        assert_eq!(past_tense("modify"), "Modified");
    }
}
