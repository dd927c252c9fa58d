//! Envelope encoding for the bundled transport
//!
//! Only the JSON text framing is implemented. `Format::MsgPack` exists so the
//! connection parameters can advertise it for transports that bring their own
//! binary codec.

use super::message::ProtocolMessage;
use crate::traits::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};

/// A single WebSocket frame payload
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Get the message as text, if it is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(s) => Some(s),
            WsMessage::Binary(_) => None,
        }
    }

    /// Get the message as binary, if it is binary
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            WsMessage::Text(_) => None,
            WsMessage::Binary(b) => Some(b),
        }
    }
}

/// Wire format advertised in the connection query string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    MsgPack,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::MsgPack => "msgpack",
        }
    }
}

/// Encode an outbound envelope as a JSON text frame
pub fn encode(message: &ProtocolMessage) -> Result<WsMessage> {
    serde_json::to_string(message)
        .map(WsMessage::Text)
        .map_err(|e| RealtimeError::ParseError(format!("Failed to encode {}: {}", message.action, e)))
}

/// Decode an inbound frame; binary frames are treated as UTF-8 JSON
pub fn decode(frame: &WsMessage) -> Result<ProtocolMessage> {
    let result = match frame {
        WsMessage::Text(text) => serde_json::from_str(text),
        WsMessage::Binary(bytes) => serde_json::from_slice(bytes),
    };
    result.map_err(|e| RealtimeError::ParseError(e.to_string()))
}
