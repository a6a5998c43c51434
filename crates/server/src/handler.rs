//! Tunnel protocol operations
//!
//! Implements open / write / read / close / clean on top of the
//! [`ConnectionRegistry`]. The HTTP layer only extracts parameters and
//! maps [`ServerError`]s to status codes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use sohtunnel_core::{
    decode_payload, encode_payload, ConnectionConfig, DEFAULT_READ_TIMEOUT_MS,
};

use crate::registry::{CleanReport, ConnectionRegistry};
use crate::{Result, ServerError};

/// Tunnel server configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Long-poll ceiling for a read with no data
    pub read_timeout: Duration,
    /// Timeout for connecting to a tunnel target
    pub connect_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Server-side tunnel protocol handler
pub struct TunnelHandler {
    config: TunnelConfig,
    registry: Arc<ConnectionRegistry>,
}

impl TunnelHandler {
    pub fn new(config: TunnelConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.connect_timeout));
        Self { config, registry }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open a tunnel for `caller` and return its connection id
    pub async fn open(&self, config: ConnectionConfig, caller: IpAddr) -> Result<String> {
        info!(
            "New connection received from {} for target {} (buffer size {}, base64 {})",
            caller,
            config.target(),
            config.buffer_size,
            config.base64_encoding
        );
        config.validate()?;
        self.registry.create(config, caller).await
    }

    /// Apply a write body to the tunnel's target socket
    pub async fn write(&self, id: &str, caller: IpAddr, body: &[u8]) -> Result<()> {
        debug!(
            "Write request from {} for {} with body length {}",
            caller,
            id,
            body.len()
        );
        let entry = self.registry.lookup(id, caller)?;

        let decoded;
        let bytes = if entry.config().base64_encoding {
            decoded = decode_payload(body)?;
            decoded.as_slice()
        } else {
            body
        };

        if !bytes.is_empty() {
            entry.write_all(bytes).await?;
        }
        Ok(())
    }

    /// Long-poll the tunnel's target socket.
    ///
    /// Returns an empty body if nothing arrived within the read timeout.
    pub async fn read(&self, id: &str, caller: IpAddr) -> Result<Vec<u8>> {
        debug!("Read request from {} for {}", caller, id);
        let entry = self.registry.lookup(id, caller)?;

        let bytes = match entry.read_available(self.config.read_timeout).await {
            Ok(bytes) => bytes,
            Err(ServerError::EndOfStream) => {
                info!("Target closed the connection for {}", id);
                return Err(ServerError::EndOfStream);
            }
            Err(e) => return Err(e),
        };

        if bytes.is_empty() || !entry.config().base64_encoding {
            Ok(bytes)
        } else {
            Ok(encode_payload(&bytes))
        }
    }

    /// Close a tunnel and forget it
    pub async fn close(&self, id: &str, caller: IpAddr) -> Result<()> {
        info!("Close request from {} for {}", caller, id);
        self.registry.lookup(id, caller)?;

        if self.registry.remove(id).await {
            Ok(())
        } else {
            Err(ServerError::NotFound)
        }
    }

    /// Close every tunnel
    pub async fn clean(&self) -> CleanReport {
        info!("Cleaning connections");
        let report = self.registry.drain_all().await;
        info!("{}", report);
        report
    }
}
