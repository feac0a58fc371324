use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub id_file: PathBuf,
}

impl SshConfig {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Vault name passed to every vault call.
    pub name: String,
    /// Directory the vault keeps its uploads and archives in.
    pub root: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub working_directory: PathBuf,
    pub ssh: SshConfig,
    pub vault: VaultConfig,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_max_uploading_parts")]
    pub max_uploading_parts: usize,
    #[serde(default = "default_part_retry_cooldown_secs")]
    pub part_retry_cooldown_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_max_uploading_parts() -> usize {
    8
}

fn default_part_retry_cooldown_secs() -> u64 {
    10 * 60
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_uploading_parts == 0 {
            return Err(ConfigError::Invalid(
                "maxUploadingParts must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "tickIntervalSecs must be at least 1".to_string(),
            ));
        }
        if self.vault.name.is_empty() {
            return Err(ConfigError::Invalid("vault.name is empty".to_string()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn database_path(&self) -> PathBuf {
        self.working_directory.join("oat.db")
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".config")
        .join("offsite-archive-tool")
        .join("offsite-archive-tool.json")
}
