//! SIP message model, codec, and transport
//!
//! The message representation is deliberately permissive: headers are kept
//! as an ordered list of name/value pairs so Via ordering survives a
//! parse/serialize round trip, while lookups are case-insensitive and
//! understand the RFC 3261 compact forms.

pub mod message;
pub mod parser;
pub mod transport;

pub use message::{SipMessage, SipMethod, StartLine};
pub use parser::{parse_message, StreamFramer};
pub use transport::{SipTransportLayer, TransportEvent, TransportKind};

/// Magic cookie prefixing every RFC 3261 branch parameter.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generate a transaction branch parameter.
pub fn generate_branch() -> String {
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rand::random::<u64>())
}

/// Generate a dialog tag.
pub fn generate_tag() -> String {
    format!("{:x}", rand::random::<u64>())
}

/// Generate a Call-ID value.
pub fn generate_call_id(domain: &str) -> String {
    format!("{:x}-{:x}@{}", rand::random::<u64>(), rand::random::<u32>(), domain)
}
