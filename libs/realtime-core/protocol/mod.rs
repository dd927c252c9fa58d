//! Wire protocol model
//!
//! Envelope, action tags, error info, and the JSON codec used by the bundled
//! WebSocket transport.

pub mod action;
pub mod codec;
pub mod error_info;
pub mod message;

pub use action::Action;
pub use codec::{decode, encode, Format, WsMessage};
pub use error_info::{codes, ErrorInfo};
pub use message::{
    flags, AuthDetails, ConnectionDetails, Message, PresenceAction, PresenceMessage,
    ProtocolMessage,
};

/// Protocol version sent as the `v` query parameter
pub const PROTOCOL_VERSION: &str = "1.0";
