//! Per-connection relay between a local socket and a tunnel
//!
//! Two independent loops run for each session:
//!
//! - write loop: local socket → `/write`, then a final `/close`
//! - read loop: `/read` long-poll → local socket
//!
//! Either loop ending cancels the shared token, which stops the other one.

use std::fmt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sohtunnel_core::{decode_payload, encode_payload, ConnectionConfig};

use crate::api::TunnelApi;
use crate::{ClientError, Result};

/// Byte counters for one relayed connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read from the local socket and delivered to the tunnel
    pub bytes_sent: u64,
    /// Bytes received from the tunnel and written to the local socket
    pub bytes_received: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes sent, {} bytes received", self.bytes_sent, self.bytes_received)
    }
}

/// Relays local connections through a tunnel server
#[derive(Debug, Clone)]
pub struct TunnelDriver {
    api: TunnelApi,
    config: ConnectionConfig,
}

impl TunnelDriver {
    pub fn new(api: TunnelApi, config: ConnectionConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a tunnel and relay `local` through it until either side closes.
    ///
    /// Fails only if the tunnel cannot be opened; the local socket is
    /// dropped in that case.
    pub async fn run(&self, local: TcpStream) -> Result<SessionStats> {
        let id = self.api.open(&self.config).await?;
        info!("Tunnel {} opened to {}", id, self.config.target());

        let (local_reader, local_writer) = local.into_split();
        let closed = CancellationToken::new();

        let write_task = tokio::spawn(write_loop(
            self.api.clone(),
            id.clone(),
            self.config.clone(),
            local_reader,
            closed.clone(),
        ));

        let bytes_received = read_loop(
            &self.api,
            &id,
            self.config.base64_encoding,
            local_writer,
            closed.clone(),
        )
        .await;

        let bytes_sent = match write_task.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Write loop for tunnel {} panicked: {}", id, e);
                0
            }
        };

        let stats = SessionStats {
            bytes_sent,
            bytes_received,
        };
        info!("Tunnel {} finished: {}", id, stats);
        Ok(stats)
    }
}

/// Local socket → tunnel
async fn write_loop(
    api: TunnelApi,
    id: String,
    config: ConnectionConfig,
    mut local: OwnedReadHalf,
    closed: CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; config.buffer_size];
    let mut sent = 0u64;
    let mut local_eof = false;

    while !local_eof {
        let mut n = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = local.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Local socket for tunnel {} reached end of stream", id);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Local read for tunnel {} failed: {}", id, e);
                    break;
                }
            },
        };

        // Batch whatever else is already waiting
        while n < buf.len() {
            match local.try_read(&mut buf[n..]) {
                Ok(0) => {
                    local_eof = true;
                    break;
                }
                Ok(m) => n += m,
                Err(_) => break,
            }
        }

        let body = if config.base64_encoding {
            encode_payload(&buf[..n])
        } else {
            buf[..n].to_vec()
        };

        if let Err(e) = api.write(&id, body).await {
            warn!("Write to tunnel {} failed: {}", id, e);
            break;
        }
        sent += n as u64;
    }

    if let Err(e) = api.close(&id).await {
        debug!("Close of tunnel {} failed: {}", id, e);
    }
    closed.cancel();
    sent
}

/// Tunnel → local socket
async fn read_loop(
    api: &TunnelApi,
    id: &str,
    base64_encoding: bool,
    mut local: OwnedWriteHalf,
    closed: CancellationToken,
) -> u64 {
    let mut received = 0u64;

    loop {
        let body = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = api.read(id) => match result {
                Ok(body) => body,
                Err(ClientError::EndOfStream) => {
                    info!("Target closed tunnel {}", id);
                    break;
                }
                Err(e) => {
                    warn!("Read from tunnel {} failed: {}", id, e);
                    break;
                }
            },
        };

        if body.is_empty() {
            continue;
        }

        let bytes = if base64_encoding {
            match decode_payload(&body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("{}", ClientError::MalformedPayload(e.to_string()));
                    break;
                }
            }
        } else {
            body
        };

        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            result = local.write_all(&bytes) => result,
        };
        if let Err(e) = result {
            debug!("Local write for tunnel {} failed: {}", id, e);
            break;
        }
        received += bytes.len() as u64;
    }

    closed.cancel();
    if let Err(e) = local.shutdown().await {
        debug!("Local shutdown for tunnel {} failed: {}", id, e);
    }
    received
}
