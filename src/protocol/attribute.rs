//! STUN attribute definitions
//!
//! Each attribute is a TLV: type (2 bytes), value length (2 bytes, excluding
//! padding), value padded with zeros to a 4-byte boundary.
//!
//! Address attributes share one value layout:
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0 0 0 0 0 0 0|    Family     |             Port              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Address (32 bits or 128 bits)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//! XOR-MAPPED-ADDRESS XORs the port with the top 16 bits of the magic cookie
//! and the address with the cookie followed by the transaction id.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::error::DecodeError;
use super::message::{TransactionId, MAGIC_COOKIE};

/// STUN attribute type codes
pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const RESPONSE_ADDRESS: u16 = 0x0002;
pub const CHANGE_REQUEST: u16 = 0x0003;
pub const SOURCE_ADDRESS: u16 = 0x0004;
pub const CHANGED_ADDRESS: u16 = 0x0005;
pub const USERNAME: u16 = 0x0006;
pub const PASSWORD: u16 = 0x0007;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const REFLECTED_FROM: u16 = 0x000B;
pub const REALM: u16 = 0x0014;
pub const NONCE: u16 = 0x0015;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const PADDING: u16 = 0x0026;
pub const RESPONSE_PORT: u16 = 0x0027;
pub const SOFTWARE: u16 = 0x8022;
pub const ALTERNATE_SERVER: u16 = 0x8023;
pub const FINGERPRINT: u16 = 0x8028;
pub const RESPONSE_ORIGIN: u16 = 0x802B;
pub const OTHER_ADDRESS: u16 = 0x802C;

/// Comprehension-required attributes we accept without interpreting them
const OPAQUE_REQUIRED: &[u16] = &[
    RESPONSE_ADDRESS,
    USERNAME,
    PASSWORD,
    MESSAGE_INTEGRITY,
    UNKNOWN_ATTRIBUTES,
    REFLECTED_FROM,
    REALM,
    NONCE,
    PADDING,
    RESPONSE_PORT,
];

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Largest ERROR-CODE whose class fits in 3 bits; larger codes encode as this
const MAX_ERROR_CODE: u16 = 799;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// Whether a type code falls in the comprehension-required range
pub fn is_comprehension_required(attr_type: u16) -> bool {
    attr_type < 0x8000
}

/// CHANGE-REQUEST flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeRequest {
    /// Ask the server to reply from its alternate IP
    pub change_ip: bool,
    /// Ask the server to reply from its alternate port
    pub change_port: bool,
}

impl ChangeRequest {
    pub const NONE: Self = Self {
        change_ip: false,
        change_port: false,
    };

    pub const IP_AND_PORT: Self = Self {
        change_ip: true,
        change_port: true,
    };

    pub const PORT: Self = Self {
        change_ip: false,
        change_port: true,
    };

    pub fn is_none(self) -> bool {
        !self.change_ip && !self.change_port
    }

    pub fn to_u32(self) -> u32 {
        let mut flags = 0u32;
        if self.change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if self.change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        flags
    }

    pub fn from_u32(value: u32) -> Self {
        Self {
            change_ip: (value & CHANGE_IP_FLAG) != 0,
            change_port: (value & CHANGE_PORT_FLAG) != 0,
        }
    }
}

/// A decoded STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// MAPPED-ADDRESS (0x0001)
    MappedAddress(SocketAddr),
    /// CHANGE-REQUEST (0x0003)
    ChangeRequest(ChangeRequest),
    /// SOURCE-ADDRESS (0x0004), RFC 3489
    SourceAddress(SocketAddr),
    /// CHANGED-ADDRESS (0x0005), RFC 3489
    ChangedAddress(SocketAddr),
    /// ERROR-CODE (0x0009)
    ErrorCode { code: u16, reason: String },
    /// XOR-MAPPED-ADDRESS (0x0020)
    XorMappedAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// RESPONSE-ORIGIN (0x802B), RFC 5780
    ResponseOrigin(SocketAddr),
    /// OTHER-ADDRESS (0x802C), RFC 5780
    OtherAddress(SocketAddr),
    /// Any attribute this client does not interpret, kept verbatim
    Unknown(u16, Vec<u8>),
}

impl Attribute {
    /// Attribute type code
    pub fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => MAPPED_ADDRESS,
            Self::ChangeRequest(_) => CHANGE_REQUEST,
            Self::SourceAddress(_) => SOURCE_ADDRESS,
            Self::ChangedAddress(_) => CHANGED_ADDRESS,
            Self::ErrorCode { .. } => ERROR_CODE,
            Self::XorMappedAddress(_) => XOR_MAPPED_ADDRESS,
            Self::Software(_) => SOFTWARE,
            Self::ResponseOrigin(_) => RESPONSE_ORIGIN,
            Self::OtherAddress(_) => OTHER_ADDRESS,
            Self::Unknown(t, _) => *t,
        }
    }

    /// Append the attribute (header, value and padding) to `buf`
    ///
    /// Returns false and leaves `buf` untouched when the value does not fit
    /// the 16-bit length field.
    pub(crate) fn encode_into(&self, transaction_id: &TransactionId, buf: &mut Vec<u8>) -> bool {
        let value = self.encode_value(transaction_id);
        let Ok(len) = u16::try_from(value.len()) else {
            return false;
        };

        buf.extend_from_slice(&self.attr_type().to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&value);

        let padding = padded_len(value.len()) - value.len();
        buf.extend(std::iter::repeat(0).take(padding));
        true
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr)
            | Self::SourceAddress(addr)
            | Self::ChangedAddress(addr)
            | Self::ResponseOrigin(addr)
            | Self::OtherAddress(addr) => encode_address(*addr),
            Self::XorMappedAddress(addr) => {
                encode_address(xor_address(*addr, transaction_id))
            }
            Self::ChangeRequest(flags) => flags.to_u32().to_be_bytes().to_vec(),
            Self::ErrorCode { code, reason } => {
                let code = (*code).min(MAX_ERROR_CODE);
                let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Decode one attribute value
    pub(crate) fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, DecodeError> {
        let invalid = DecodeError::InvalidAttribute(attr_type);

        match attr_type {
            MAPPED_ADDRESS => Ok(Self::MappedAddress(decode_address(value).ok_or(invalid)?)),
            SOURCE_ADDRESS => Ok(Self::SourceAddress(decode_address(value).ok_or(invalid)?)),
            CHANGED_ADDRESS => Ok(Self::ChangedAddress(decode_address(value).ok_or(invalid)?)),
            RESPONSE_ORIGIN => Ok(Self::ResponseOrigin(decode_address(value).ok_or(invalid)?)),
            OTHER_ADDRESS => Ok(Self::OtherAddress(decode_address(value).ok_or(invalid)?)),
            XOR_MAPPED_ADDRESS => {
                let addr = decode_address(value).ok_or(invalid)?;
                Ok(Self::XorMappedAddress(xor_address(addr, transaction_id)))
            }
            CHANGE_REQUEST => {
                let flags: [u8; 4] = value.try_into().map_err(|_| invalid)?;
                Ok(Self::ChangeRequest(ChangeRequest::from_u32(u32::from_be_bytes(
                    flags,
                ))))
            }
            ERROR_CODE => {
                if value.len() < 4 {
                    return Err(invalid);
                }
                let class = u16::from(value[2] & 0x07);
                let number = u16::from(value[3]);
                Ok(Self::ErrorCode {
                    code: class * 100 + number,
                    reason: String::from_utf8_lossy(&value[4..]).into_owned(),
                })
            }
            SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).into_owned())),
            _ if is_comprehension_required(attr_type) && !OPAQUE_REQUIRED.contains(&attr_type) => {
                Err(DecodeError::UnknownRequiredAttribute(attr_type))
            }
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// Value length rounded up to the 4-byte boundary
pub(crate) fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);

    match value[1] {
        FAMILY_IPV4 => {
            let octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            Some(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        _ => None,
    }
}

/// XOR an address with the cookie (and transaction id for IPv6).
/// The operation is its own inverse.
fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);

    let ip: IpAddr = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (b, k) in octets.iter_mut().zip(key.iter()) {
                *b ^= k;
            }
            Ipv4Addr::from(octets).into()
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            for (b, k) in octets.iter_mut().zip(key.iter()) {
                *b ^= k;
            }
            Ipv6Addr::from(octets).into()
        }
    };

    SocketAddr::new(ip, port)
}
