//! `tdo pull`, `tdo push`, `tdo sync` against the configured collection.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use colored::Colorize;

use tdo_core::Store;
use tdo_sync::{PullReport, PushReport, RemoteClient, SyncError, SyncOptions};

use crate::context::Context;
use crate::render::{print_changes, print_conflicts};

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    Pull,
    Push,
    Both,
}

pub fn run(ctx: &Context, direction: Direction) -> Result<()> {
    let config = ctx.config()?;
    let remote = ctx.remote(&config)?;
    let options = ctx.sync_options(&config);
    let store = ctx.store();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let push = runtime.block_on(exchange(&store, remote, &options, direction));
    let push = push.with_context(|| format!("sync with env '{}' failed", ctx.env))?;

    if let Some(push) = push {
        print_push(&push);
        if !push.is_clean() {
            bail!("{} change(s) could not be pushed", push.failures.len());
        }
    }
    Ok(())
}

async fn exchange(
    store: &Store,
    remote: Arc<dyn RemoteClient>,
    options: &SyncOptions,
    direction: Direction,
) -> Result<Option<PushReport>, SyncError> {
    match direction {
        Direction::Pull => {
            let report = tdo_sync::pull(store, remote, options).await?;
            print_pull(&report);
            Ok(None)
        }
        Direction::Push => Ok(Some(tdo_sync::push(store, remote, options).await?)),
        Direction::Both => {
            let report = tdo_sync::sync(store, remote, options).await?;
            print_pull(&report.pull);
            Ok(Some(report.push))
        }
    }
}

fn print_pull(report: &PullReport) {
    println!(
        "✓ Pulled {} task(s): {} new, {} updated, {} removed",
        report.fetched,
        report.diff.created(),
        report.diff.updated(),
        report.diff.deleted()
    );
    print_changes(&report.diff);
    if !report.conflicts.is_empty() {
        println!("{}", format!("{} conflict(s):", report.conflicts.len()).yellow());
        print_conflicts(&report.conflicts);
    }
}

fn print_push(report: &PushReport) {
    if report.pushed() == 0 && report.failures.is_empty() {
        println!("✓ Nothing to push");
        return;
    }
    println!(
        "✓ Pushed {} change(s): {} created, {} updated, {} deleted",
        report.pushed(),
        report.created,
        report.updated,
        report.deleted
    );
    for failure in &report.failures {
        println!("  {} {}: {}", "✗".red().bold(), failure.task, failure.error);
    }
}
