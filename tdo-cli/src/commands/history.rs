//! `tdo undo`, `tdo history`, `tdo compact`.

use anyhow::{Context as _, Result};
use chrono::Local;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use crate::context::Context;
use crate::render::print_changes;

pub fn undo(ctx: &Context) -> Result<()> {
    let changes = ctx.store().undo().context("undo failed")?;
    println!("✓ Undid {} change(s)", changes.len());
    print_changes(&changes);
    Ok(())
}

pub fn compact(ctx: &Context) -> Result<()> {
    let moved = ctx.store().compact().context("compact failed")?;
    let renumbered: Vec<_> = moved.iter().filter(|(old, new)| old != new).collect();
    if renumbered.is_empty() {
        println!("✓ Indices already compact");
    } else {
        println!("✓ Renumbered {} task(s)", renumbered.len());
        for (old, new) in renumbered {
            println!("  {old} → {new}");
        }
    }
    println!("{}", "Undo history cleared.".bright_black());
    Ok(())
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// How many entries to show, newest first.
    #[arg(long, short = 'n', default_value_t = 10)]
    pub limit: usize,

    /// Show field-level changes under each entry.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "#")]
    seq: u64,
    #[tabled(rename = "When")]
    at: String,
    #[tabled(rename = "Command")]
    operation: String,
    #[tabled(rename = "Tasks")]
    tasks: usize,
}

impl HistoryArgs {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let tables = ctx.store().read().context("failed to read task store")?;
        let entries: Vec<_> = tables.journal.entries().rev().take(self.limit).collect();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries).context("failed to serialize history")?
            );
            return Ok(());
        }
        if entries.is_empty() {
            println!("No history.");
            return Ok(());
        }

        if self.verbose {
            for entry in &entries {
                let label = match entry.undoes {
                    Some(seq) => format!("{} (reverts #{seq})", entry.operation),
                    None => entry.operation.clone(),
                };
                println!(
                    "{} {} {}",
                    format!("#{}", entry.seq).cyan(),
                    entry.at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                    label.bold()
                );
                print_changes(&entry.diff);
            }
            return Ok(());
        }

        let rows: Vec<HistoryRow> = entries
            .iter()
            .map(|entry| HistoryRow {
                seq: entry.seq,
                at: entry
                    .at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
                operation: entry.operation.clone(),
                tasks: entry.diff.len(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
