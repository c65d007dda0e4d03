//! STUN client
//!
//! Entry point for discovery and keep-alive. A client either owns no
//! transport, binding a temporary one for each discovery, or shares a
//! transport supplied by the caller.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::nat::{Classifier, Discovery, Host};
use crate::network::{DatagramChannel, StunError, UdpTransport};

/// Port used when a server address does not name one
pub const DEFAULT_PORT: u16 = 3478;

/// STUN client
///
/// Calls on one shared transport must not overlap: responses are matched by
/// transaction id and origin, but two transactions reading from the same
/// socket would consume each other's datagrams.
pub struct Client<C = UdpTransport> {
    config: ClientConfig,
    conn: Option<Arc<C>>,
}

impl Client<UdpTransport> {
    /// Create a client that binds a temporary transport per discovery
    pub fn new(config: ClientConfig) -> Self {
        Self { config, conn: None }
    }
}

impl<C: DatagramChannel> Client<C> {
    /// Create a client on a caller-owned transport
    pub fn with_connection(conn: Arc<C>, config: ClientConfig) -> Self {
        Self {
            config,
            conn: Some(conn),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Classify the NAT in front of us using `server` (`host[:port]`)
    pub async fn discover(&self, server: &str) -> Result<Discovery, StunError> {
        let server = resolve(server).await?;
        self.discover_addr(server).await
    }

    /// Classify the NAT in front of us using an already resolved server
    pub async fn discover_addr(&self, server: SocketAddr) -> Result<Discovery, StunError> {
        match &self.conn {
            Some(conn) => {
                Classifier::new(conn.as_ref(), &self.config)
                    .classify(server)
                    .await
            }
            None => {
                let transport = UdpTransport::ephemeral_for(server).await?;
                debug!(
                    "Using temporary transport {} for discovery",
                    transport.local_addr()
                );
                Classifier::new(&transport, &self.config)
                    .classify(server)
                    .await
            }
        }
    }

    /// Refresh the mapping of the shared transport and return it
    ///
    /// Only a single binding request is made, retried per the probe policy.
    pub async fn keepalive(&self, server: &str) -> Result<Host, StunError> {
        let conn = self.connection()?;
        let server = resolve(server).await?;
        refresh(conn, &self.config, server).await
    }

    /// Same as [`Client::keepalive`] with an already resolved server
    pub async fn keepalive_addr(&self, server: SocketAddr) -> Result<Host, StunError> {
        let conn = self.connection()?;
        refresh(conn, &self.config, server).await
    }

    fn connection(&self) -> Result<&C, StunError> {
        self.conn.as_deref().ok_or(StunError::NoConnection)
    }
}

async fn refresh<C: DatagramChannel>(
    conn: &C,
    config: &ClientConfig,
    server: SocketAddr,
) -> Result<Host, StunError> {
    let response = Classifier::new(conn, config)
        .binding(server)
        .await?
        .ok_or(StunError::NoResponse)?;

    if !response.is_success() {
        let reason = match response.message.error_code() {
            Some((code, reason)) => format!("error response {} {}", code, reason),
            None => "error response".to_string(),
        };
        return Err(StunError::InvalidResponse(reason));
    }

    let mapped = response
        .message
        .mapped_address()
        .ok_or_else(|| StunError::InvalidResponse("no mapped address".to_string()))?;

    debug!("Keep-alive mapped address: {}", mapped);
    Ok(Host::new(mapped))
}

/// Resolve a server address, defaulting the port to [`DEFAULT_PORT`]
///
/// Accepts `host:port`, `[v6]:port`, and bare hosts or IP addresses.
pub async fn resolve(server: &str) -> Result<SocketAddr, StunError> {
    let target = with_default_port(server);
    let resolution_error = |source| StunError::AddressResolution {
        address: server.to_string(),
        source,
    };

    let mut addrs = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(resolution_error)?;

    addrs.next().ok_or_else(|| {
        resolution_error(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses found",
        ))
    })
}

fn with_default_port(server: &str) -> String {
    let server = server.trim();

    if server.parse::<SocketAddr>().is_ok() {
        return server.to_string();
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    if let Some(ip) = server.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return format!("[{}]:{}", ip, DEFAULT_PORT);
    }
    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{}:{}", server, DEFAULT_PORT),
    }
}
