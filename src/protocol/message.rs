//! STUN message framing
//!
//! Header format (20 bytes):
//! - type: 2 bytes (two zero bits, then method and class bits interleaved)
//! - length: 2 bytes (body length, excluding the header)
//! - magic cookie: 4 bytes (0x2112A442)
//! - transaction id: 12 bytes
//!
//! The body is a sequence of attributes, each padded to 4 bytes.

use std::net::SocketAddr;

use tracing::warn;

use super::attribute::{self, padded_len, Attribute, ChangeRequest};
use super::error::DecodeError;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Value XORed into the CRC-32 of a FINGERPRINT attribute ("STUN")
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Largest body the 16-bit length field can describe, kept 4-byte aligned
pub const MAX_BODY_SIZE: usize = 0xFFFC;

/// FINGERPRINT attribute size including its header
const FINGERPRINT_SIZE: usize = 8;

/// 96-bit transaction identifier
pub type TransactionId = [u8; 12];

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

/// Message method (12 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    Other(u16),
}

impl Method {
    pub fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Other(m) => m & 0x0FFF,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code & 0x0FFF {
            0x001 => Self::Binding,
            m => Self::Other(m),
        }
    }
}

/// Encode method and class into the 16-bit type field
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn encode_type(method: Method, class: MessageClass) -> u16 {
    let m = method.code();
    let c = class.bits();

    (m & 0x000F) | ((c & 0b01) << 4) | ((m & 0x0070) << 1) | ((c & 0b10) << 7) | ((m & 0x0F80) << 2)
}

fn decode_type(value: u16) -> (Method, MessageClass) {
    let class = ((value >> 4) & 0b01) | ((value >> 7) & 0b10);
    let method = (value & 0x000F) | ((value >> 1) & 0x0070) | ((value >> 2) & 0x0F80);

    (Method::from_code(method), MessageClass::from_bits(class))
}

/// A STUN message
///
/// FINGERPRINT is not kept in `attributes`: it is always the last attribute
/// on the wire, so it is modeled as a flag that the encoder honors and the
/// decoder sets after verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: MessageClass,
    pub method: Method,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
    pub fingerprint: bool,
}

impl Message {
    pub fn new(class: MessageClass, method: Method, transaction_id: TransactionId) -> Self {
        Self {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
            fingerprint: false,
        }
    }

    /// Create a Binding Request with a random transaction id
    pub fn binding_request() -> Self {
        Self::new(MessageClass::Request, Method::Binding, rand::random())
    }

    /// Create an empty Binding success response for `transaction_id`
    pub fn binding_response(transaction_id: TransactionId) -> Self {
        Self::new(MessageClass::SuccessResponse, Method::Binding, transaction_id)
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: Attribute) {
        self.attributes.push(attr);
    }

    /// Builder form of [`Message::add_attribute`]
    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Request a FINGERPRINT attribute on encode
    pub fn with_fingerprint(mut self) -> Self {
        self.fingerprint = true;
        self
    }

    /// Serialize the message to bytes
    ///
    /// The body length field is 16 bits, so an attribute that would push the
    /// body past [`MAX_BODY_SIZE`] bytes is left out.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 64);

        buf.extend_from_slice(&encode_type(self.method, self.class).to_be_bytes());
        // Length is patched once the body is written
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        let budget = if self.fingerprint {
            MAX_BODY_SIZE - FINGERPRINT_SIZE
        } else {
            MAX_BODY_SIZE
        };
        for attr in &self.attributes {
            let mark = buf.len();
            let encoded = attr.encode_into(&self.transaction_id, &mut buf);
            if !encoded || buf.len() - HEADER_SIZE > budget {
                warn!(
                    "Dropping attribute 0x{:04X}: message body would exceed {} bytes",
                    attr.attr_type(),
                    MAX_BODY_SIZE
                );
                buf.truncate(mark);
            }
        }

        if self.fingerprint {
            // The CRC covers a header whose length already counts FINGERPRINT
            let length = buf.len() - HEADER_SIZE + FINGERPRINT_SIZE;
            set_length(&mut buf, length);
            let crc = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            buf.extend_from_slice(&attribute::FINGERPRINT.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&crc.to_be_bytes());
        } else {
            let length = buf.len() - HEADER_SIZE;
            set_length(&mut buf, length);
        }

        buf
    }

    /// Deserialize a message from bytes
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        let fingerprint = fingerprint_offset(data);
        if let Some(at) = fingerprint {
            let value = &data[at + 4..at + FINGERPRINT_SIZE];
            let expected = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            let crc = crc32fast::hash(&data[..at]) ^ FINGERPRINT_XOR;
            if crc != expected {
                return Err(DecodeError::BadChecksum);
            }
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;

        if HEADER_SIZE + length > data.len() {
            return Err(DecodeError::Truncated);
        }
        if length % 4 != 0 || HEADER_SIZE + length != data.len() {
            return Err(DecodeError::BadLength);
        }

        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(DecodeError::BadCookie);
        }

        if msg_type & 0xC000 != 0 {
            return Err(DecodeError::BadMessageType);
        }
        let (method, class) = decode_type(msg_type);

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..HEADER_SIZE]);

        let body = &data[HEADER_SIZE..];
        let end = if fingerprint.is_some() {
            body.len() - FINGERPRINT_SIZE
        } else {
            body.len()
        };

        let mut attributes = Vec::new();
        let mut offset = 0;
        while offset < end {
            if offset + 4 > end {
                return Err(DecodeError::Truncated);
            }

            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            let value_start = offset + 4;

            if value_start + padded_len(attr_len) > end {
                return Err(DecodeError::Truncated);
            }
            if attr_type == attribute::FINGERPRINT {
                // Only valid as the last attribute, handled above
                return Err(DecodeError::InvalidAttribute(attr_type));
            }

            let value = &body[value_start..value_start + attr_len];
            attributes.push(Attribute::decode(attr_type, value, &transaction_id)?);

            offset = value_start + padded_len(attr_len);
        }

        Ok(Self {
            class,
            method,
            transaction_id,
            attributes,
            fingerprint: fingerprint.is_some(),
        })
    }

    /// The reflexive address, preferring XOR-MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });

        xor.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                Attribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// The server's alternate endpoint: CHANGED-ADDRESS, else OTHER-ADDRESS
    pub fn alternate_address(&self) -> Option<SocketAddr> {
        let changed = self.attributes.iter().find_map(|attr| match attr {
            Attribute::ChangedAddress(addr) => Some(*addr),
            _ => None,
        });

        changed.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                Attribute::OtherAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// CHANGE-REQUEST flags carried by this message
    pub fn change_request(&self) -> ChangeRequest {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                Attribute::ChangeRequest(flags) => Some(*flags),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// ERROR-CODE as (code, reason)
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn software(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Software(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

/// `length` never exceeds [`MAX_BODY_SIZE`]
fn set_length(buf: &mut [u8], length: usize) {
    buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());
}

/// Offset of the FINGERPRINT attribute ending the datagram, if there is one
///
/// The trailing TLV is a FINGERPRINT when walking the attribute headers from
/// the start of the body lands on it. A value that merely ends in the same
/// bytes is skipped over by the walk. When the walk breaks down on a corrupted
/// attribute length while the header length still matches the datagram, the
/// trailer is kept so the corruption is reported as a checksum failure.
fn fingerprint_offset(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE + FINGERPRINT_SIZE {
        return None;
    }

    let start = data.len() - FINGERPRINT_SIZE;
    let attr_type = u16::from_be_bytes([data[start], data[start + 1]]);
    let attr_len = u16::from_be_bytes([data[start + 2], data[start + 3]]);
    if attr_type != attribute::FINGERPRINT || attr_len != 4 {
        return None;
    }

    let mut offset = HEADER_SIZE;
    while offset < start {
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4 + padded_len(len);
    }
    if offset == start {
        return Some(start);
    }

    let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
    (offset != data.len() && HEADER_SIZE + declared == data.len()).then_some(start)
}
