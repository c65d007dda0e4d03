//! Single STUN request/response exchange
//!
//! One call sends one datagram and waits, up to a deadline, for the matching
//! response. Retransmission is left to the caller.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::protocol::{ChangeRequest, Message, MessageClass};

use super::error::StunError;
use super::transport::DatagramChannel;

/// Receive buffer size; larger than any STUN response we expect
pub const RECV_BUFFER_SIZE: usize = 2048;

/// A response matched to its request
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Decoded response
    pub message: Message,
    /// Endpoint the response came from
    pub source: SocketAddr,
}

impl Exchange {
    pub fn is_success(&self) -> bool {
        self.message.class == MessageClass::SuccessResponse
    }
}

/// Send `request` to `destination` and wait for its response
///
/// A datagram matches when it decodes, is a response, carries the request's
/// transaction id, and arrives from an endpoint consistent with the request's
/// CHANGE-REQUEST flags. Anything else is dropped and the wait continues
/// until `timeout` elapses, which yields [`StunError::Timeout`].
pub async fn exchange<C: DatagramChannel + ?Sized>(
    conn: &C,
    request: &Message,
    destination: SocketAddr,
    timeout: Duration,
) -> Result<Exchange, StunError> {
    let data = request.encode();
    let deadline = Instant::now() + timeout;
    let change = request.change_request();

    trace!("Request to {}: {:?}", destination, request);
    conn.send_to(&data, destination).await?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (len, source) = match timeout_at(deadline, conn.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) if is_transient(&e) => {
                debug!("Ignoring transient receive error: {}", e);
                continue;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(StunError::Timeout),
        };

        let message = match Message::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!("Discarding {} byte datagram from {}: {}", len, source, e);
                continue;
            }
        };

        if message.transaction_id != request.transaction_id {
            trace!("Discarding response for another transaction from {}", source);
            continue;
        }
        if matches!(message.class, MessageClass::Request | MessageClass::Indication) {
            trace!("Discarding {:?} from {}", message.class, source);
            continue;
        }
        if !origin_matches(destination, source, change) {
            debug!(
                "Discarding response from unexpected origin {} (sent to {}, {:?})",
                source, destination, change
            );
            continue;
        }

        trace!("Response from {}: {:?}", source, message);
        return Ok(Exchange { message, source });
    }
}

/// Whether `source` is where a server honoring `change` would reply from
pub fn origin_matches(destination: SocketAddr, source: SocketAddr, change: ChangeRequest) -> bool {
    let ip_changed = source.ip() != destination.ip();
    let port_changed = source.port() != destination.port();

    ip_changed == change.change_ip && port_changed == change.change_port
}

/// ICMP errors surfaced on unconnected sockets by some platforms
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
