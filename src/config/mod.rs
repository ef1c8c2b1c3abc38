//! Configuration module for Tally.
//!
//! Handles the TOML settings file and environment variable expansion.

mod settings;

pub use settings::{
    expand_env_vars, LoggingSettings, Settings, SettingsError, StoreBackend, StoreSettings,
};
