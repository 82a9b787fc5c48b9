//! Per-environment configuration and on-disk layout.
//!
//! # Storage layout
//!
//! ```text
//! ~/.config/tdo/
//!   config.<env>.yaml      (remote binding and display options, mode 0600)
//! ~/.cache/tdo/<env>/
//!   tasks.json             (mirror, pending, tombstones, journal, mode 0600)
//!   tasks.lock             (advisory lock serialising commands)
//! ```
//!
//! # API pattern
//!
//! Every function touching the home directory has two forms:
//! - `fn_at(home: &Path, …)` takes an explicit home; tests use it with `TempDir`
//! - `fn(…)` derives home from `dirs::home_dir()` and delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::EnvName;

pub const DEFAULT_PUSH_CONCURRENCY: usize = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// 1. Config document
// ---------------------------------------------------------------------------

/// Where an environment's remote collection lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Directory holding one `.ics` file per task.
    pub path: PathBuf,
}

/// Contents of `config.<env>.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// Adds a UID column to `tdo list`.
    #[serde(default)]
    pub show_uids: bool,
    /// Upper bound on in-flight remote writes during push.
    #[serde(default = "default_push_concurrency")]
    pub push_concurrency: usize,
    /// Per-request remote timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            remote: None,
            show_uids: false,
            push_concurrency: DEFAULT_PUSH_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn default_push_concurrency() -> usize {
    DEFAULT_PUSH_CONCURRENCY
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

// ---------------------------------------------------------------------------
// 2. Path helpers (pure, no I/O)
// ---------------------------------------------------------------------------

/// `<home>/.config/tdo/`
pub fn config_dir_at(home: &Path) -> PathBuf {
    home.join(".config").join("tdo")
}

/// `<home>/.config/tdo/config.<env>.yaml`
pub fn config_path_at(home: &Path, env: &EnvName) -> PathBuf {
    config_dir_at(home).join(format!("config.{}.yaml", env.0))
}

/// `<home>/.cache/tdo/<env>/`
pub fn cache_dir_at(home: &Path, env: &EnvName) -> PathBuf {
    home.join(".cache").join("tdo").join(&env.0)
}

/// `<home>/.cache/tdo/<env>/tasks.json`
pub fn store_path_at(home: &Path, env: &EnvName) -> PathBuf {
    cache_dir_at(home, env).join("tasks.json")
}

/// Rejects names that cannot be embedded in a file name.
pub fn validate_env(env: &EnvName) -> Result<(), ConfigError> {
    if env.is_valid() {
        Ok(())
    } else {
        Err(ConfigError::InvalidEnv(env.0.clone()))
    }
}

/// Environments with a config file under `<home>/.config/tdo/`, sorted by name.
pub fn list_envs_at(home: &Path) -> Result<Vec<EnvName>, ConfigError> {
    let dir = config_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let entries = std::fs::read_dir(&dir).map_err(|source| ConfigError::Io {
        path: dir.clone(),
        source,
    })?;
    let mut names: Vec<EnvName> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_prefix("config.")
                .and_then(|rest| rest.strip_suffix(".yaml"))
                .map(EnvName::from)
        })
        .filter(EnvName::is_valid)
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(names)
}

/// `list_envs_at` convenience wrapper.
pub fn list_envs() -> Result<Vec<EnvName>, ConfigError> {
    list_envs_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load a config file. `ConfigError::NotFound` if absent, `ConfigError::Parse`
/// (with path + line context) if malformed.
pub fn load_config_from(path: &Path) -> Result<EnvConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `config.<env>.yaml`.
pub fn load_config_at(home: &Path, env: &EnvName) -> Result<EnvConfig, ConfigError> {
    validate_env(env)?;
    load_config_from(&config_path_at(home, env))
}

/// `load_config_at` convenience wrapper.
pub fn load_config(env: &EnvName) -> Result<EnvConfig, ConfigError> {
    load_config_at(&home()?, env)
}

/// Like [`load_config_from`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<EnvConfig, ConfigError> {
    match load_config_from(path) {
        Err(ConfigError::NotFound { .. }) => Ok(EnvConfig::default()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write a config file.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_config_to(path: &Path, config: &EnvConfig) -> Result<(), ConfigError> {
    let io = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(io)?;
            set_dir_permissions(dir).map_err(io)?;
        }
    }
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(io)?;
    set_file_permissions(&tmp_path).map_err(io)?;
    std::fs::rename(&tmp_path, path).map_err(io)?;
    Ok(())
}

/// Write `config.<env>.yaml`, refusing to overwrite unless `force`.
pub fn init_config_at(
    home: &Path,
    env: &EnvName,
    config: &EnvConfig,
    force: bool,
) -> Result<PathBuf, ConfigError> {
    validate_env(env)?;
    let path = config_path_at(home, env);
    init_config_to(&path, config, force)?;
    Ok(path)
}

/// `init_config_at` against an explicit file.
pub fn init_config_to(path: &Path, config: &EnvConfig, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    save_config_to(path, config)
}

/// `init_config_at` convenience wrapper.
pub fn init_config(env: &EnvName, config: &EnvConfig, force: bool) -> Result<PathBuf, ConfigError> {
    init_config_at(&home()?, env, config, force)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
pub(crate) fn set_dir_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}
#[cfg(not(unix))]
pub(crate) fn set_dir_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_file_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
#[cfg(not(unix))]
pub(crate) fn set_file_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env() -> EnvName {
        EnvName::from("work")
    }

    #[test]
    fn paths_are_per_environment() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path(), &env()).ends_with(".config/tdo/config.work.yaml"));
        assert!(store_path_at(home.path(), &env()).ends_with(".cache/tdo/work/tasks.json"));
    }

    #[test]
    fn init_then_load_config() {
        let home = TempDir::new().expect("tempdir");
        let config = EnvConfig {
            remote: Some(RemoteConfig {
                path: PathBuf::from("/srv/cal/work"),
            }),
            show_uids: true,
            ..EnvConfig::default()
        };
        let path = init_config_at(home.path(), &env(), &config, false).expect("init");
        assert!(path.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
        assert_eq!(load_config_at(home.path(), &env()).expect("load"), config);
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let home = TempDir::new().expect("tempdir");
        init_config_at(home.path(), &env(), &EnvConfig::default(), false).expect("first");
        let err = init_config_at(home.path(), &env(), &EnvConfig::default(), false).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists { .. }));
        init_config_at(home.path(), &env(), &EnvConfig::default(), true).expect("forced");
    }

    #[test]
    fn missing_config_is_not_found() {
        let home = TempDir::new().expect("tempdir");
        let err = load_config_at(home.path(), &env()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
        let path = config_path_at(home.path(), &env());
        assert_eq!(load_config_or_default(&path).unwrap(), EnvConfig::default());
    }

    #[test]
    fn omitted_keys_take_defaults() {
        let config: EnvConfig = serde_yaml::from_str("show_uids: true\n").unwrap();
        assert_eq!(config.push_concurrency, DEFAULT_PUSH_CONCURRENCY);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(config.remote.is_none());
    }

    #[test]
    fn invalid_env_name_is_rejected() {
        let home = TempDir::new().expect("tempdir");
        let err = load_config_at(home.path(), &EnvName::from("../x")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(_)));
    }

    #[test]
    fn list_envs_finds_config_files() {
        let home = TempDir::new().expect("tempdir");
        for name in ["work", "home"] {
            init_config_at(home.path(), &EnvName::from(name), &EnvConfig::default(), false)
                .expect("init");
        }
        let names = list_envs_at(home.path()).expect("list");
        assert_eq!(names, vec![EnvName::from("home"), EnvName::from("work")]);
    }
}
