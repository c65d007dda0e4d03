//! natprobe - STUN client and NAT type discovery
//!
//! This library encodes and decodes STUN messages, runs request/response
//! transactions over UDP, and classifies the NAT between the local host
//! and the public Internet following RFC 3489.

pub mod client;
pub mod config;
pub mod nat;
pub mod network;
pub mod protocol;

pub use client::{resolve, Client, DEFAULT_PORT};
pub use config::{ClientConfig, ProbePolicy, DEFAULT_SOFTWARE_NAME};
pub use nat::{Discovery, Host, NatType};
pub use network::{DatagramChannel, StunError, UdpTransport};
pub use protocol::{DecodeError, Message};
