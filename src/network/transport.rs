//! UDP transport layer
//!
//! [`DatagramChannel`] is the only thing the STUN engine needs from the
//! network: send a datagram, receive one, and report the local address.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

/// A connectionless, bidirectional datagram channel
///
/// Reads must fail promptly once the channel is closed so that callers can
/// abort an in-flight transaction by closing it.
pub trait DatagramChannel: Send + Sync {
    /// Send one datagram to `target`
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram, returning its length and sender
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Local address the channel is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramChannel for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

impl<T: DatagramChannel> DatagramChannel for Arc<T> {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        T::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        T::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        T::local_addr(self)
    }
}

/// UDP transport for STUN transactions
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        // Create socket with socket2 for SO_REUSEADDR support
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Lets a keep-alive transport be rebound to the same port after a restart
        socket.set_reuse_address(true)?;

        // Set non-blocking mode for async operation
        socket.set_nonblocking(true)?;

        socket.bind(&addr.into())?;

        // Convert to Tokio UdpSocket
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!(
            "UDP transport bound to {} (SO_REUSEADDR enabled)",
            local_addr
        );

        Ok(Self { socket, local_addr })
    }

    /// Bind an ephemeral port on the wildcard address of `server`'s family
    pub async fn ephemeral_for(server: SocketAddr) -> io::Result<Self> {
        let ip: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        Self::bind(SocketAddr::new(ip, 0)).await
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl DatagramChannel for UdpTransport {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(buf, target).await?;
        trace!("Sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        trace!("Received {} bytes from {}", len, addr);
        Ok((len, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
