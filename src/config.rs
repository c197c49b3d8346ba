//! Layered configuration for the inference core and the terminal front end.
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed `OLLAMA_TUI_`
//! 2. Explicit config path (if provided)
//! 3. Project root: `./ollama-tui.toml`
//! 4. Global: `$XDG_CONFIG_HOME/ollama-tui/config.toml`
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const PROJECT_CONFIG_FILE: &str = "ollama-tui.toml";
const ENV_PREFIX: &str = "OLLAMA_TUI_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root URL of the backend, without a trailing `/api`.
    pub base_url: String,
    /// First-byte bound for the connect probe.
    pub probe_timeout_secs: u64,
    /// Bound for the model listing request.
    pub list_timeout_secs: u64,
    /// First-byte bound for a generation request; `0` waits indefinitely.
    /// The streamed body itself is never bounded.
    pub generation_first_byte_timeout_secs: Option<u64>,
    /// Forwarded as the request `keep_alive` field (e.g. `"5m"`).
    pub keep_alive: Option<String>,
    /// Directory for the front end's log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            probe_timeout_secs: 30,
            list_timeout_secs: 15,
            generation_first_byte_timeout_secs: Some(300),
            keep_alive: None,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn generation_first_byte_timeout(&self) -> Option<Duration> {
        self.generation_first_byte_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.probe_timeout_secs == 0 || self.list_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Configuration loader that handles file discovery and merging
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(config_path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                figment = figment.merge(Toml::file(&global_path));
            }
        }

        let project_path = PathBuf::from(PROJECT_CONFIG_FILE);
        if project_path.exists() {
            figment = figment.merge(Toml::file(&project_path));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        Self::extract(figment)
    }

    /// Load a single file on top of the defaults, ignoring global, project and
    /// environment sources.
    #[cfg(test)]
    fn load_file(path: &Path) -> Result<Config, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Config, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/ollama-tui/config.toml`, or the platform equivalent.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ollama-tui").join("config.toml"))
    }

    pub fn default_log_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("ollama-tui"))
            .unwrap_or_else(std::env::temp_dir)
    }
}
