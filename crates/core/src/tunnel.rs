//! Tunnel connection parameters and wire constants
//!
//! A client opens a tunnel by POSTing a [`ConnectionConfig`] to `/connect`.
//! The server answers with a connection id, which the client then presents
//! in the [`HEADER_CONNECTION_ID`] header on every later call.

use serde::{Deserialize, Serialize};

use crate::{Result, SohTunnelError};

/// Header carrying the connection id on write/read/close calls
pub const HEADER_CONNECTION_ID: &str = "X-SOH-ID";

/// Default chunk size for client-side reads and server-side read scratch
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Largest `bufferSize` a tunnel may ask for (1 MiB)
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default server long-poll ceiling for `/read`, in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// Text returned by the server's `/` route
pub const SERVER_INFO: &str = "sohtunnel";

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Parameters for one tunnel, sent by the client at open time.
///
/// Field names on the wire are camelCase (`bufferSize`, `base64Encoding`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Target hostname or IP the server connects to
    pub host: String,
    /// Target port
    pub port: u16,
    /// Chunk size for reads on both ends of the tunnel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Whether payload bytes travel as Base64 text
    #[serde(default)]
    pub base64_encoding: bool,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            buffer_size: DEFAULT_BUFFER_SIZE,
            base64_encoding: false,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_base64_encoding(mut self, enabled: bool) -> Self {
        self.base64_encoding = enabled;
        self
    }

    /// Reject configs the server must not act on
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SohTunnelError::InvalidConfig("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(SohTunnelError::InvalidConfig("port is 0".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(SohTunnelError::InvalidConfig("bufferSize is 0".to_string()));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(SohTunnelError::InvalidConfig(format!(
                "bufferSize {} exceeds {}",
                self.buffer_size, MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// `host:port` form used for connecting and logging
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
