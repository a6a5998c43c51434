//! SOH Tunnel Client
//!
//! Client side of the TCP-over-HTTP tunnel: accepts local TCP connections
//! and relays each one through a tunnel server using plain HTTP calls.
//!
//! ## Components
//!
//! - **TunnelApi**: typed calls to the server's `/connect`, `/write`,
//!   `/read` and `/close` routes
//! - **TunnelDriver**: relays one local connection with two independent
//!   loops (local → `/write`, `/read` → local)
//! - **TunnelListener**: local accept loop spawning one driver per connection

mod api;
mod driver;
mod listener;

pub use api::TunnelApi;
pub use driver::{SessionStats, TunnelDriver};
pub use listener::TunnelListener;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{operation} failed with status {status}")]
    Status { operation: &'static str, status: u16 },

    #[error("Tunnel target closed the connection")]
    EndOfStream,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid tunnel URL: {0}")]
    InvalidUrl(String),

    #[error("Local socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
