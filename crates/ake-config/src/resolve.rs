//! Config and store-root resolution.
//!
//! Resolution order for the config file:
//! 1. Explicit `--config <file>`
//! 2. `AKE_CONFIG`
//! 3. `$XDG_CONFIG_HOME/agent_knowledge/config.json`
//! 4. Platform config dir (`dirs::config_dir()`)
//! 5. Built-in defaults
//!
//! The store root follows the same shape with `--store`, `AKE_STORE`,
//! `$XDG_DATA_HOME` and `dirs::data_dir()`.

use crate::settings::Config;
use crate::validate::{validate, ValidationError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_CONFIG: &str = "AKE_CONFIG";
pub const ENV_STORE: &str = "AKE_STORE";
const DIR_NAME: &str = "agent_knowledge";
const CONFIG_FILE_NAME: &str = "config.json";

/// Errors from config resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config {path}: {errors:?}")]
    Invalid {
        path: PathBuf,
        errors: Vec<ValidationError>,
    },

    #[error("explicit config file does not exist: {0}")]
    Missing(PathBuf),

    #[error("failed to resolve a data directory for the store")]
    StoreRootUnavailable,
}

impl From<ResolveError> for ake_common::Error {
    fn from(err: ResolveError) -> Self {
        ake_common::Error::Config(err.to_string())
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigPaths {
    /// File that was loaded, if any.
    pub config_file: Option<PathBuf>,
    /// Which resolution step produced the file.
    pub source: &'static str,
}

/// A loaded, validated configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub config: Config,
    pub paths: ConfigPaths,
    pub using_defaults: bool,
}

/// Resolve and load the configuration from the process environment.
pub fn resolve_config(cli_path: Option<&Path>) -> Result<ResolvedConfig, ResolveError> {
    resolve_config_with(cli_path, |key| std::env::var(key).ok())
}

/// Resolve with an injectable environment lookup.
pub fn resolve_config_with<F>(cli_path: Option<&Path>, env: F) -> Result<ResolvedConfig, ResolveError>
where
    F: Fn(&str) -> Option<String>,
{
    // An explicitly named file must exist; discovered locations are optional.
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(ResolveError::Missing(path.to_path_buf()));
        }
        return load_file(path, "cli");
    }
    if let Some(path) = env(ENV_CONFIG).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(ResolveError::Missing(path));
        }
        return load_file(&path, "env");
    }

    let mut discovered = Vec::new();
    if let Some(xdg) = env("XDG_CONFIG_HOME").filter(|p| !p.is_empty()) {
        discovered.push((
            PathBuf::from(xdg).join(DIR_NAME).join(CONFIG_FILE_NAME),
            "xdg",
        ));
    }
    if let Some(base) = dirs::config_dir() {
        discovered.push((base.join(DIR_NAME).join(CONFIG_FILE_NAME), "platform"));
    }
    for (path, source) in discovered {
        if path.exists() {
            return load_file(&path, source);
        }
    }

    Ok(ResolvedConfig {
        config: Config::default(),
        paths: ConfigPaths {
            config_file: None,
            source: "defaults",
        },
        using_defaults: true,
    })
}

fn load_file(path: &Path, source: &'static str) -> Result<ResolvedConfig, ResolveError> {
    let content = fs::read_to_string(path).map_err(|e| ResolveError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: Config = serde_json::from_str(&content).map_err(|e| ResolveError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let result = validate(&config);
    if !result.is_valid() {
        return Err(ResolveError::Invalid {
            path: path.to_path_buf(),
            errors: result.errors,
        });
    }
    Ok(ResolvedConfig {
        config,
        paths: ConfigPaths {
            config_file: Some(path.to_path_buf()),
            source,
        },
        using_defaults: false,
    })
}

/// Resolve the store root directory from the process environment.
pub fn resolve_store_root(cli_path: Option<&Path>) -> Result<PathBuf, ResolveError> {
    resolve_store_root_with(cli_path, |key| std::env::var(key).ok())
}

pub fn resolve_store_root_with<F>(cli_path: Option<&Path>, env: F) -> Result<PathBuf, ResolveError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = cli_path {
        return Ok(path.to_path_buf());
    }
    if let Some(dir) = env(ENV_STORE).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = env("XDG_DATA_HOME").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(xdg).join(DIR_NAME));
    }
    dirs::data_dir()
        .map(|base| base.join(DIR_NAME))
        .ok_or(ResolveError::StoreRootUnavailable)
}
