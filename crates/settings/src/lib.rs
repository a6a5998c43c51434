//! SOH Tunnel Settings
//!
//! Configuration for both tunnel roles, stored as a JSON file.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use sohtunnel_settings::Settings;
//!
//! let path = PathBuf::from("sohtunnel.json");
//! let mut settings = Settings::load_from(&path)?;
//! settings.server.read_timeout_ms = 5_000;
//! settings.save()?;
//! # Ok::<(), sohtunnel_settings::SettingsError>(())
//! ```

mod config;

pub use config::{ClientSettings, ServerSettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("No settings path configured")]
    NoPath,
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings file used when none is given: `sohtunnel.json` in the working directory
pub fn default_settings_path() -> PathBuf {
    PathBuf::from("sohtunnel.json")
}
