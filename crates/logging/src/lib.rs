//! SOH Tunnel Logging
//!
//! Shared `tracing-subscriber` setup for the server and client binaries.
//!
//! `RUST_LOG` takes precedence when set; otherwise everything logs at
//! `info` and the `sohtunnel*` crates at the requested level.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Unknown log level: {0}")]
    UnknownLevel(String),
}

pub type Result<T> = std::result::Result<T, LoggingError>;

/// Verbosity of the `sohtunnel` crates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Filter directive used when `RUST_LOG` is not set
    pub fn default_directive(&self) -> String {
        let level = self.as_str();
        format!(
            "info,sohtunnel={level},sohtunnel_core={level},sohtunnel_server={level},sohtunnel_client={level}"
        )
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(LoggingError::UnknownLevel(other.to_string())),
        }
    }
}

fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.default_directive()))
}

/// Install the global subscriber, failing if one is already set
pub fn try_init(level: LogLevel) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(build_filter(level))
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}

/// Install the global subscriber, ignoring a previously installed one
pub fn init(level: LogLevel) {
    let _ = try_init(level);
}
