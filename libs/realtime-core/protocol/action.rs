use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol message action tag
///
/// Encoded on the wire as its numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl Action {
    /// Actions that carry user data and therefore need a `msgSerial`
    #[inline]
    pub fn is_data_bearing(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }

    /// Actions that are addressed to a channel rather than the connection
    #[inline]
    pub fn is_channel_scoped(self) -> bool {
        matches!(
            self,
            Action::Attach
                | Action::Attached
                | Action::Detach
                | Action::Detached
                | Action::Presence
                | Action::Message
                | Action::Sync
        )
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        let action = match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => return Err(format!("unknown protocol action {}", other)),
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
