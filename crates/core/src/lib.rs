//! SOH Tunnel Core Types
//!
//! Shared between the tunnel server and the tunnel client: the
//! connection parameters sent at open time, wire constants, and the
//! optional Base64 payload transcoding.

mod codec;
mod error;
mod tunnel;

pub use codec::{decode_payload, encode_payload};
pub use error::*;
pub use tunnel::*;
