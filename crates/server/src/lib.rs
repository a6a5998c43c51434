//! SOH Tunnel Server
//!
//! Server side of the TCP-over-HTTP tunnel.
//!
//! ## Responsibilities
//!
//! 1. Open an outbound TCP connection per `/connect` call and hand back an id
//! 2. Bind every later call on that id to the address that opened it
//! 3. Apply `/write` bodies to the target socket in call order
//! 4. Long-poll the target socket on `/read`, bounded by the read timeout
//! 5. Close tunnels on `/close`, or all of them on `/clean`

mod handler;
mod http;
mod registry;

pub use handler::{TunnelConfig, TunnelHandler};
pub use http::{router, TunnelServer};
pub use registry::{CleanReport, ConnectionRegistry, EntryInfo, TunnelEntry};

use axum::http::StatusCode;
use thiserror::Error;

use sohtunnel_core::{SohTunnelError, HEADER_CONNECTION_ID};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Unable to find connection")]
    NotFound,

    #[error("Connection belongs to another address")]
    Forbidden,

    #[error("Tunnel connect failed: {0}")]
    ConnectFailed(String),

    #[error("EOF reached")]
    EndOfStream,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("Missing or invalid {} header", HEADER_CONNECTION_ID)]
    MissingConnectionId,

    #[error("Tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// HTTP status this error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ConnectFailed(_) => StatusCode::BAD_GATEWAY,
            Self::EndOfStream => StatusCode::PRECONDITION_FAILED,
            Self::MalformedPayload(_) | Self::InvalidConfig(_) | Self::MissingConnectionId => {
                StatusCode::BAD_REQUEST
            }
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SohTunnelError> for ServerError {
    fn from(err: SohTunnelError) -> Self {
        match err {
            SohTunnelError::InvalidConfig(msg) => Self::InvalidConfig(msg),
            SohTunnelError::MalformedPayload(msg) => Self::MalformedPayload(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
