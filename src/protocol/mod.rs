//! STUN wire format
//!
//! Encodes and decodes STUN messages and their attributes (RFC 3489 / 5389 / 5780).

mod attribute;
mod error;
mod message;

pub use attribute::{
    is_comprehension_required, Attribute, ChangeRequest, ALTERNATE_SERVER, CHANGED_ADDRESS,
    CHANGE_REQUEST, ERROR_CODE, FINGERPRINT, MAPPED_ADDRESS, MESSAGE_INTEGRITY, NONCE,
    OTHER_ADDRESS, PADDING, PASSWORD, REALM, REFLECTED_FROM, RESPONSE_ADDRESS, RESPONSE_ORIGIN,
    RESPONSE_PORT, SOFTWARE, SOURCE_ADDRESS, UNKNOWN_ATTRIBUTES, USERNAME, XOR_MAPPED_ADDRESS,
};
pub use error::DecodeError;
pub use message::{
    Message, MessageClass, Method, TransactionId, FINGERPRINT_XOR, HEADER_SIZE, MAGIC_COOKIE,
    MAX_BODY_SIZE,
};
