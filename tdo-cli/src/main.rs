//! tdo: a command-line task manager mirroring a CalDAV-style task collection.
//!
//! # Usage
//!
//! ```text
//! tdo [--env <name>] add <words> [+tag] [key:value] ...
//! tdo modify <indices> <words> [+tag] [-tag] [key:value] ...
//! tdo do|start|stop|del [<indices> | <filter>]
//! tdo list [<filter>] [--json]
//! tdo waiting [--json]
//! tdo pull | push | sync
//! tdo undo | history | compact
//! tdo move <env> [<indices> | <filter>]
//! tdo config init [--calendar <dir>] [--force] | config show | config list
//! ```

mod commands;
mod context;
mod render;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigCommand,
    history::HistoryArgs,
    list::{ListArgs, WaitingArgs},
    sync::Direction,
    task::{MoveArgs, TokenArgs},
};
use context::Context;
use tdo_core::Status;

/// Log filter variable; defaults to `warn`.
const LOG_VAR: &str = "TDO_LOG";

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tdo",
    version,
    about = "Manage tasks locally and sync them with a calendar collection",
    long_about = None,
)]
struct Cli {
    /// Environment (one remote collection and its local store).
    #[arg(long, global = true, env = "TDO_ENV")]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a task from free-form tokens.
    Add(TokenArgs),

    /// Edit the selected tasks.
    Modify(TokenArgs),

    /// Mark tasks completed.
    Do(TokenArgs),

    /// Mark tasks in progress.
    Start(TokenArgs),

    /// Mark tasks as needing action again.
    Stop(TokenArgs),

    /// Delete tasks.
    Del(TokenArgs),

    /// Show open tasks that are not waiting.
    List(ListArgs),

    /// Show tasks whose wait time is still in the future.
    Waiting(WaitingArgs),

    /// Fetch the remote collection into the local store.
    Pull,

    /// Send local changes to the remote collection.
    Push,

    /// Pull, then push.
    Sync,

    /// Revert the most recent local command.
    Undo,

    /// Show recent local commands.
    History(HistoryArgs),

    /// Move tasks into another environment.
    Move(MoveArgs),

    /// Renumber task indices without gaps. Clears the undo history.
    Compact,

    /// Manage per-environment configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let ctx = Context::resolve(cli.env)?;
    match cli.command {
        Commands::Add(args) => args.add(&ctx),
        Commands::Modify(args) => args.modify(&ctx),
        Commands::Do(args) => args.set_status(&ctx, "do", Status::Completed),
        Commands::Start(args) => args.set_status(&ctx, "start", Status::InProcess),
        Commands::Stop(args) => args.set_status(&ctx, "stop", Status::NeedsAction),
        Commands::Del(args) => args.delete(&ctx),
        Commands::List(args) => args.run(&ctx),
        Commands::Waiting(args) => args.run(&ctx),
        Commands::Pull => commands::sync::run(&ctx, Direction::Pull),
        Commands::Push => commands::sync::run(&ctx, Direction::Push),
        Commands::Sync => commands::sync::run(&ctx, Direction::Both),
        Commands::Undo => commands::history::undo(&ctx),
        Commands::History(args) => args.run(&ctx),
        Commands::Move(args) => args.run(&ctx),
        Commands::Compact => commands::history::compact(&ctx),
        Commands::Config { command } => commands::config::run(&ctx, command),
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
