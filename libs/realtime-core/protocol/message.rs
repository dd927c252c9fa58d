use super::action::Action;
use super::error_info::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flag bits carried in `ProtocolMessage::flags`
pub mod flags {
    pub const HAS_PRESENCE: u32 = 1 << 0;
    pub const HAS_BACKLOG: u32 = 1 << 1;
    pub const RESUMED: u32 = 1 << 2;
}

/// Wire envelope exchanged with the service
///
/// Built by the engine, handed to the transport, and never modified after
/// dispatch. Inbound envelopes are decoded by the codec and routed by action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            msg_serial: None,
            count: None,
            error: None,
            flags: None,
            timestamp: None,
            messages: None,
            presence: None,
            connection_details: None,
            auth: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn attach(channel: impl Into<String>) -> Self {
        Self::new(Action::Attach).with_channel(channel)
    }

    pub fn detach(channel: impl Into<String>) -> Self {
        Self::new(Action::Detach).with_channel(channel)
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn heartbeat(id: impl Into<String>) -> Self {
        let mut message = Self::new(Action::Heartbeat);
        message.id = Some(id.into());
        message
    }

    pub fn messages(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        let mut message = Self::new(Action::Message).with_channel(channel);
        message.messages = Some(messages);
        message
    }

    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        let mut message = Self::new(Action::Presence).with_channel(channel);
        message.presence = Some(presence);
        message
    }

    pub fn auth(access_token: impl Into<String>) -> Self {
        let mut message = Self::new(Action::Auth);
        message.auth = Some(AuthDetails {
            access_token: access_token.into(),
        });
        message
    }

    /// Ack/Nack messages carrying `msgSerial` and `count`
    pub fn ack(msg_serial: i64, count: u32) -> Self {
        let mut message = Self::new(Action::Ack);
        message.msg_serial = Some(msg_serial);
        message.count = Some(count);
        message
    }

    pub fn nack(msg_serial: i64, count: u32, error: Option<ErrorInfo>) -> Self {
        let mut message = Self::new(Action::Nack);
        message.msg_serial = Some(msg_serial);
        message.count = Some(count);
        message.error = error;
        message
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.map_or(false, |f| f & flag != 0)
    }
}

/// Connection parameters returned by the service in `Connected`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// A user message published on or received from a channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("unknown presence action {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}
