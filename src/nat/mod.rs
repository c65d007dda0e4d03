//! NAT behavior discovery
//!
//! Classifies the NAT between a local socket and the Internet by probing a
//! STUN server that supports CHANGE-REQUEST (RFC 3489).

mod classifier;
mod types;

pub use classifier::Classifier;
pub use types::{Discovery, Family, Host, NatType};
