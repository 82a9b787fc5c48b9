//! `tdo config init` and `tdo config show`.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};

use tdo_core::env::{self, DEFAULT_PUSH_CONCURRENCY, DEFAULT_TIMEOUT_SECS};
use tdo_core::{EnvConfig, RemoteConfig};

use crate::context::Context;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write the config file for the selected environment.
    Init(InitArgs),
    /// Print the resolved configuration and file locations.
    Show,
    /// List environments that have a config file.
    List,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory of `.ics` files that holds this environment's tasks.
    #[arg(long, value_name = "DIR")]
    pub calendar: Option<PathBuf>,

    /// Show task UIDs in `tdo list`.
    #[arg(long)]
    pub show_uids: bool,

    /// Maximum remote writes in flight during push.
    #[arg(long, default_value_t = DEFAULT_PUSH_CONCURRENCY)]
    pub push_concurrency: usize,

    /// Per-request remote timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

pub fn run(ctx: &Context, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init(args) => init(ctx, args),
        ConfigCommand::Show => show(ctx),
        ConfigCommand::List => list(ctx),
    }
}

fn init(ctx: &Context, args: InitArgs) -> Result<()> {
    let remote = match args.calendar {
        Some(path) => {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .context("cannot resolve current directory")?
                    .join(path)
            };
            Some(RemoteConfig { path })
        }
        None => None,
    };
    let config = EnvConfig {
        remote,
        show_uids: args.show_uids,
        push_concurrency: args.push_concurrency.max(1),
        timeout_secs: args.timeout_secs,
    };
    env::init_config_to(&ctx.config_path, &config, args.force)
        .with_context(|| format!("failed to init config for env '{}'", ctx.env))?;

    println!("✓ Configured env '{}'", ctx.env);
    println!("  Saved to: {}", ctx.config_path.display());
    if config.remote.is_none() {
        println!("  No calendar set; pull, push and sync need --calendar <dir>.");
    }
    Ok(())
}

fn show(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    println!("env:    {}", ctx.env);
    println!("config: {}", ctx.config_path.display());
    println!("store:  {}", ctx.store_path.display());
    print!(
        "{}",
        serde_yaml::to_string(&config).context("failed to serialize config")?
    );
    Ok(())
}

fn list(ctx: &Context) -> Result<()> {
    let envs = env::list_envs_at(&ctx.home).context("failed to list environments")?;
    if envs.is_empty() {
        println!("No environments configured.");
        println!("Run: tdo --env <name> config init --calendar <dir>");
        return Ok(());
    }
    for name in envs {
        let marker = if name == ctx.env { "*" } else { " " };
        println!("{marker} {name}");
    }
    Ok(())
}
