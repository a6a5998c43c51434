use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SohTunnelError {
    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

pub type Result<T> = std::result::Result<T, SohTunnelError>;
