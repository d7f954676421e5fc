//! CLI configuration file and environment overrides.

use std::env;
use std::path::{Path, PathBuf};

use outbox_core::util::{is_http_url, normalize_text_option};
use outbox_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Everything a command needs after merging flags, env and the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub engine: EngineConfig,
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("outbox")
        .join(CONFIG_FILE_NAME)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("outbox")
        .join("outbox.db")
}

impl CliConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|error| {
            CliError::Config(format!(
                "Failed to read config at {}: {}",
                path.display(),
                error
            ))
        })?;
        let config = serde_json::from_str::<Self>(&raw).map_err(|error| {
            CliError::Config(format!(
                "Failed to parse config at {}: {}",
                path.display(),
                error
            ))
        })?;
        config.engine.validate()?;
        Ok(config)
    }
}

/// Resolve settings from flags, the process environment and the config file
pub fn resolve_settings(
    cli_db_path: Option<PathBuf>,
    cli_config_path: Option<PathBuf>,
) -> Result<Settings, CliError> {
    let config_path = cli_config_path.unwrap_or_else(default_config_path);
    let config = CliConfig::load_from_path(&config_path)?;
    resolve_with(cli_db_path, config, |key| env::var(key).ok())
}

/// Precedence: flag, then environment, then config file, then default
pub fn resolve_with(
    cli_db_path: Option<PathBuf>,
    config: CliConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings, CliError> {
    let db_path = cli_db_path
        .or_else(|| normalize_text_option(lookup("OUTBOX_DB_PATH")).map(PathBuf::from))
        .or(config.db_path)
        .unwrap_or_else(default_db_path);

    let remote_url = normalize_text_option(lookup("OUTBOX_REMOTE_URL"))
        .or_else(|| normalize_text_option(config.remote_url));
    if let Some(url) = &remote_url {
        if !is_http_url(url) {
            return Err(CliError::Config(format!(
                "Remote URL must start with http:// or https://: {url}"
            )));
        }
    }

    Ok(Settings {
        db_path,
        remote_url,
        remote_token: normalize_text_option(lookup("OUTBOX_REMOTE_TOKEN")),
        engine: config.engine,
    })
}
