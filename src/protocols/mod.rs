//! Protocol implementations for the Rivet PBX

pub mod dtmf;
pub mod rtp;
pub mod sdp;
pub mod sip;

pub use rtp::RtpPacket;
pub use sdp::SessionDescription;
pub use sip::{SipMessage, SipMethod};
