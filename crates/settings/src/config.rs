//! Configuration types

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sohtunnel_core::{DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT_MS};

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Tunnel server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Tunnel client settings
    #[serde(default)]
    pub client: ClientSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Settings from `sohtunnel.json` in the working directory
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Read settings from `path`.
    ///
    /// A missing file yields defaults; either way the result remembers
    /// `path` so a later [`Settings::save`] writes back to it.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => {
                let parsed: Settings =
                    serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
                info!("Loaded settings from {}", path.display());
                parsed
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(SettingsError::ReadError(e)),
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write back to the path these settings were loaded from
    pub fn save(&self) -> Result<()> {
        match self.config_path.as_deref() {
            Some(path) => self.save_to(path),
            None => Err(SettingsError::NoPath),
        }
    }

    /// Write pretty JSON to `path`, creating missing parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        content.push('\n');

        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir).map_err(SettingsError::CreateDirError)?
            }
            _ => {}
        }
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {}", path.display());
        Ok(())
    }
}

/// Server-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// HTTP listen address
    #[serde(default = "default_server_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Long-poll ceiling for `/read` in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Timeout for connecting to a tunnel target in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_server_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_server_listen_addr(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ServerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Client-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Local address accepting connections to tunnel
    #[serde(default = "default_client_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL of the tunnel server
    #[serde(default = "default_tunnel_url")]
    pub tunnel_url: String,

    /// Host the server should connect to
    #[serde(default)]
    pub target_host: String,

    /// Port the server should connect to
    #[serde(default)]
    pub target_port: u16,

    /// Outbound HTTP proxy (e.g. "http://proxy.corp:3128")
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Chunk size for local reads
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Send payloads as Base64 text
    #[serde(default = "default_true")]
    pub base64_encoding: bool,
}

fn default_client_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2222))
}

fn default_tunnel_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_client_listen_addr(),
            tunnel_url: default_tunnel_url(),
            target_host: String::new(),
            target_port: 0,
            proxy_url: None,
            buffer_size: default_buffer_size(),
            base64_encoding: true,
        }
    }
}
