//! Per-invocation environment: which env, where its config and store live.
//!
//! `TDO_CONFIG_FILE`, `TDO_TASK_CACHE_FILE` and `TDO_CALENDAR` override the
//! default locations for the selected environment only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, FixedOffset, Local};

use tdo_core::env::{self, config_path_at, store_path_at};
use tdo_core::{EnvConfig, EnvName, RemoteConfig, Store};
use tdo_sync::{RemoteClient, SyncOptions, VdirRemote};

pub const CONFIG_FILE_VAR: &str = "TDO_CONFIG_FILE";
pub const CACHE_FILE_VAR: &str = "TDO_TASK_CACHE_FILE";
pub const CALENDAR_VAR: &str = "TDO_CALENDAR";

#[derive(Debug, Clone)]
pub struct Context {
    pub home: PathBuf,
    pub env: EnvName,
    pub config_path: PathBuf,
    pub store_path: PathBuf,
    calendar_override: Option<PathBuf>,
}

impl Context {
    /// Resolve the environment named by `--env` / `TDO_ENV`, or `default`.
    pub fn resolve(env: Option<String>) -> Result<Self> {
        let env = env.map(EnvName::from).unwrap_or_default();
        env::validate_env(&env)?;
        let home = dirs::home_dir().context("could not determine home directory")?;

        let config_path = std::env::var_os(CONFIG_FILE_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| config_path_at(&home, &env));
        let store_path = std::env::var_os(CACHE_FILE_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| store_path_at(&home, &env));
        let calendar_override = std::env::var_os(CALENDAR_VAR).map(PathBuf::from);

        tracing::debug!(
            "env {env}: config {}, store {}",
            config_path.display(),
            store_path.display()
        );
        Ok(Self {
            home,
            env,
            config_path,
            store_path,
            calendar_override,
        })
    }

    /// Another environment under the same home, at its default locations.
    pub fn sibling(&self, env: EnvName) -> Result<Self> {
        env::validate_env(&env)?;
        Ok(Self {
            config_path: config_path_at(&self.home, &env),
            store_path: store_path_at(&self.home, &env),
            home: self.home.clone(),
            env,
            calendar_override: None,
        })
    }

    pub fn store(&self) -> Store {
        Store::at_path(&self.store_path)
    }

    /// Config file contents (defaults when absent) with env overrides applied.
    pub fn config(&self) -> Result<EnvConfig> {
        let mut config = env::load_config_or_default(&self.config_path)
            .with_context(|| format!("failed to load config for env '{}'", self.env))?;
        if let Some(path) = &self.calendar_override {
            config.remote = Some(RemoteConfig { path: path.clone() });
        }
        Ok(config)
    }

    pub fn remote(&self, config: &EnvConfig) -> Result<Arc<dyn RemoteClient>> {
        let remote = config.remote.as_ref().with_context(|| {
            format!(
                "no remote configured for env '{}'; run `tdo config init --calendar <dir>` or set {CALENDAR_VAR}",
                self.env
            )
        })?;
        Ok(Arc::new(VdirRemote::new(&remote.path)))
    }

    pub fn sync_options(&self, config: &EnvConfig) -> SyncOptions {
        SyncOptions::from(config)
    }
}

/// Wall-clock time in the user's zone; relative time expressions use it.
pub fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}
