//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "STOCKROOM_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "stockroom.db";

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_IMPORT_TIMEOUT_SECS: u64 = 120;

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub log_level: Option<String>,
    pub import_timeout_secs: Option<u64>,
    /// Fallback department names keyed by department code
    #[serde(default)]
    pub departments: BTreeMap<String, String>,
}

/// Effective configuration after all sources are merged
#[derive(Debug, Clone)]
pub struct Config {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub import_timeout: Duration,
    pub departments: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration, never failing on a missing or broken TOML file.
    ///
    /// Root folder priority:
    /// 1. Command-line argument
    /// 2. `STOCKROOM_ROOT_FOLDER`
    /// 3. `root_folder` in the TOML config file
    /// 4. OS-dependent default
    pub fn load(cli_root: Option<&Path>) -> Self {
        let (config, problem) = Self::load_deferred(cli_root);
        if let Some(e) = problem {
            warn!("Using default configuration: {}", e);
        }
        config
    }

    /// Same as [`Config::load`], but a broken config file is handed back
    /// instead of logged, for callers that set up logging from the result.
    ///
    /// A missing config file is not a problem.
    pub fn load_deferred(cli_root: Option<&Path>) -> (Self, Option<Error>) {
        let (toml_config, problem) = match config_file_path() {
            None => (TomlConfig::default(), None),
            Some(path) => match load_toml_config(&path) {
                Ok(config) => (config, None),
                Err(e) => (TomlConfig::default(), Some(e)),
            },
        };
        (Self::from_sources(cli_root, &toml_config), problem)
    }

    /// Merge an already-parsed TOML config with CLI and environment overrides
    pub fn from_sources(cli_root: Option<&Path>, toml_config: &TomlConfig) -> Self {
        Self {
            root_folder: resolve_root_folder(cli_root, ROOT_FOLDER_ENV, toml_config),
            log_level: toml_config
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            import_timeout: Duration::from_secs(
                toml_config
                    .import_timeout_secs
                    .unwrap_or(DEFAULT_IMPORT_TIMEOUT_SECS),
            ),
            departments: toml_config.departments.clone(),
        }
    }

    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }
}

/// Resolve the root folder from the highest-priority source that provides one
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config file {}: {}", path.display(), e)))
}

/// Locate the TOML config file for the platform
fn config_file_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("stockroom").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/stockroom/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stockroom"))
        .unwrap_or_else(|| PathBuf::from("./stockroom_data"))
}
