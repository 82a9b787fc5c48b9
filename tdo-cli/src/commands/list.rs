//! `tdo list` and `tdo waiting`.

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;

use tdo_core::{Selector, Task, TaskFilter};

use crate::commands::task::select;
use crate::context::{now, Context};
use crate::render::print_tasks;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Filter tokens (`+tag`, `project:x`, `due.before:fri`, ...) or indices.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "FILTER")]
    pub filter: Vec<String>,
}

impl ListArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let selector = tdo_parser::parse_selector(&self.filter, now())?;
        let tasks = match selector {
            Selector::Visible => ctx
                .store()
                .list(&TaskFilter::visible(), Utc::now())
                .context("failed to read task store")?,
            other => match select(ctx, &other)? {
                Some(tasks) => tasks,
                None => return Ok(()),
            },
        };
        show(ctx, &tasks, self.json)
    }
}

#[derive(Args, Debug)]
pub struct WaitingArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl WaitingArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let tasks = ctx
            .store()
            .list(&TaskFilter::waiting(), Utc::now())
            .context("failed to read task store")?;
        show(ctx, &tasks, self.json)
    }
}

fn show(ctx: &Context, tasks: &[Task], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(tasks).context("failed to serialize tasks")?
        );
        return Ok(());
    }
    let config = ctx.config()?;
    print_tasks(tasks, config.show_uids, Utc::now());
    Ok(())
}
