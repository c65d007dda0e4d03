//! Network module for STUN transactions
//!
//! Handles UDP transport and request/response matching.

mod error;
mod transaction;
mod transport;

pub use error::StunError;
pub use transaction::{exchange, origin_matches, Exchange, RECV_BUFFER_SIZE};
pub use transport::{DatagramChannel, UdpTransport};
