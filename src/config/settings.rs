//! TOML-based configuration for Tally.
//!
//! Supports a config file (tally.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [engine]
//! firing_policy = "queue"
//! max_queue_depth = 8
//! default_check_interval_secs = 300
//!
//! [store]
//! backend = "sqlite"
//! path = "${TALLY_HOME}/tally.db"
//!
//! [logging]
//! filter = "tally=debug"
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::trigger::EvaluatorConfig;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Trigger evaluator tuning.
    pub engine: EvaluatorConfig,

    /// Template and execution persistence.
    pub store: StoreSettings,

    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Store configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,

    /// SQLite database path (supports ${ENV_VAR} expansion). Defaults to the
    /// user data directory.
    pub path: Option<String>,
}

impl StoreSettings {
    /// Database path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.path {
            Some(path) => Ok(PathBuf::from(expand_env_vars(path)?)),
            None => dirs::data_dir()
                .map(|d| d.join("tally").join("tally.db"))
                .ok_or_else(|| {
                    SettingsError::InvalidConfig(
                        "no store path configured and no data directory available".to_string(),
                    )
                }),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "tally=info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.check()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TALLY_CONFIG`
    /// 2. `./tally.toml`
    /// 3. `~/.config/tally/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("TALLY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("tally.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tally").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn check(&self) -> Result<(), SettingsError> {
        if self.engine.default_check_interval_secs == 0 {
            return Err(SettingsError::InvalidConfig(
                "engine.default_check_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == '}' {
                    closed = true;
                    break;
                }
                var_name.push(ch);
            }
            if !closed {
                return Err(SettingsError::InvalidConfig(format!(
                    "unterminated variable reference in '{}'",
                    s
                )));
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    var_name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                // Lone `$`
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
