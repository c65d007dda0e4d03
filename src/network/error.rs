//! Network error types

use thiserror::Error;

use crate::protocol::DecodeError;

/// Errors that can occur while talking to a STUN server
#[derive(Error, Debug)]
pub enum StunError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[from] std::io::Error),

    #[error("Failed to resolve server address {address}: {source}")]
    AddressResolution {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed STUN message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transaction timeout")]
    Timeout,

    #[error("No connection available")]
    NoConnection,

    #[error("Server did not respond")]
    NoResponse,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
