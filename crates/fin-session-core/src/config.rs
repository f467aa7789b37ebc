//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! endpoints, where the session is stored, and the refresh timing knobs.
//!
//! Configuration is stored at `~/.config/fin-engine/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::RefreshEncoding;
use crate::auth::SessionConfig;
use crate::store::{FileStore, KeyringStore, SessionStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fin-engine";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `api_base_url`
pub const ENV_API_URL: &str = "FIN_ENGINE_API_URL";

/// Overrides `storage` (`file` or `keyring`)
pub const ENV_STORAGE: &str = "FIN_ENGINE_STORAGE";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not find {0} directory")]
    MissingDirectory(&'static str),

    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Where the session record is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
}

impl std::str::FromStr for StorageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" | "keychain" => Ok(StorageKind::Keyring),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub refresh_path: String,
    pub login_path: String,
    pub refresh_encoding: RefreshEncoding,
    pub storage: StorageKind,
    pub refresh_threshold_secs: u64,
    pub min_refresh_interval_secs: u64,
    pub auto_refresh_margin_secs: u64,
    pub min_auto_refresh_delay_secs: u64,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_path: "/auth/refresh".to_string(),
            login_path: "/auth/login".to_string(),
            refresh_encoding: RefreshEncoding::default(),
            storage: StorageKind::default(),
            refresh_threshold_secs: session.refresh_threshold.as_secs(),
            min_refresh_interval_secs: session.min_refresh_interval.as_secs(),
            auto_refresh_margin_secs: session.auto_refresh_margin.as_secs(),
            min_auto_refresh_delay_secs: session.min_auto_refresh_delay.as_secs(),
            last_username: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load from `path`, or defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, contents).map_err(io_err)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(value) = lookup(ENV_STORAGE) {
            self.storage = value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_STORAGE,
                value,
            })?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::MissingDirectory("config"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::MissingDirectory("cache"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Timing knobs for the session manager
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
            min_refresh_interval: Duration::from_secs(self.min_refresh_interval_secs),
            auto_refresh_margin: Duration::from_secs(self.auto_refresh_margin_secs),
            min_auto_refresh_delay: Duration::from_secs(self.min_auto_refresh_delay_secs),
        }
    }

    /// Build the configured session storage backend
    pub fn session_store(&self) -> Result<Box<dyn SessionStore>, ConfigError> {
        Ok(match self.storage {
            StorageKind::File => Box::new(FileStore::new(self.cache_dir()?)),
            StorageKind::Keyring => Box::new(KeyringStore::new()),
        })
    }
}
