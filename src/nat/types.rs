//! NAT classification results

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// NAT type classification (RFC 3489 section 10.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// The server misbehaved or its responses were unusable
    Error,
    /// Probing did not produce enough evidence
    Unknown,
    /// Mapped address equals the local address and unsolicited traffic gets through
    Open,
    /// No response to the first binding request
    Blocked,
    /// Any external host can send to the mapped port
    FullCone,
    /// A new mapping is created for each destination
    Symmetric,
    /// Only hosts we sent to can reply, from any port
    RestrictedCone,
    /// Only the exact host and port we sent to can reply
    PortRestrictedCone,
    /// Public address, but inbound traffic is filtered
    SymmetricUdpFirewall,
}

impl NatType {
    /// Whether direct UDP hole punching through a single port can work
    pub fn allows_hole_punching(self) -> bool {
        matches!(
            self,
            Self::Open
                | Self::FullCone
                | Self::RestrictedCone
                | Self::PortRestrictedCone
                | Self::SymmetricUdpFirewall
        )
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "NAT Error"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Open => write!(f, "Not behind a NAT"),
            Self::Blocked => write!(f, "Blocked"),
            Self::FullCone => write!(f, "Full cone NAT"),
            Self::Symmetric => write!(f, "Symmetric NAT"),
            Self::RestrictedCone => write!(f, "Restricted NAT"),
            Self::PortRestrictedCone => write!(f, "Port restricted NAT"),
            Self::SymmetricUdpFirewall => write!(f, "Symmetric UDP firewall"),
        }
    }
}

/// Address family of a [`Host`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// An endpoint as reported by a STUN server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host {
    addr: SocketAddr,
}

impl Host {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn family(&self) -> Family {
        if self.addr.is_ipv4() {
            Family::Ipv4
        } else {
            Family::Ipv6
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Outcome of one discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub nat_type: NatType,
    /// Externally observed address from the first successful probe
    pub mapped: Option<Host>,
}

impl Discovery {
    pub fn new(nat_type: NatType, mapped: Option<Host>) -> Self {
        Self { nat_type, mapped }
    }
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapped {
            Some(host) => write!(f, "{} ({})", self.nat_type, host),
            None => write!(f, "{}", self.nat_type),
        }
    }
}
