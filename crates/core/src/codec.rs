//! Base64 payload transcoding
//!
//! Used when a tunnel is opened with `base64Encoding`, for transports that
//! cannot carry arbitrary binary bodies.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::{Result, SohTunnelError};

/// Encode raw bytes into Base64 text bytes
pub fn encode_payload(bytes: &[u8]) -> Vec<u8> {
    STANDARD.encode(bytes).into_bytes()
}

/// Decode Base64 text bytes back into raw bytes.
///
/// Leading and trailing ASCII whitespace is ignored. Any other malformed
/// input is an error; partial output is never returned.
pub fn decode_payload(text: &[u8]) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim_ascii())
        .map_err(|e| SohTunnelError::MalformedPayload(e.to_string()))
}
