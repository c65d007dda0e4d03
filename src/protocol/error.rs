//! Codec error types

use thiserror::Error;

/// Reasons a datagram cannot be decoded as a STUN message
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Message truncated")]
    Truncated,

    #[error("Invalid magic cookie")]
    BadCookie,

    #[error("FINGERPRINT verification failed")]
    BadChecksum,

    #[error("Invalid message length")]
    BadLength,

    #[error("Invalid message type")]
    BadMessageType,

    #[error("Invalid attribute 0x{0:04x}")]
    InvalidAttribute(u16),

    #[error("Unknown comprehension-required attribute 0x{0:04x}")]
    UnknownRequiredAttribute(u16),
}
