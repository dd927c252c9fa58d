use crate::protocol::ErrorInfo;
use thiserror::Error;

/// Main error type for realtime-core
#[derive(Error, Debug, Clone)]
pub enum RealtimeError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection closed before the operation could complete
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Envelope encode/decode error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Internal channel send error (engine stopped)
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Error reported by the service or raised by a state machine
    #[error("{0}")]
    Protocol(#[from] ErrorInfo),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl RealtimeError {
    /// The protocol error behind this failure, if there is one
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            RealtimeError::Protocol(info) => Some(info),
            _ => None,
        }
    }

    /// Collapse any error into an `ErrorInfo` for state-change reasons
    pub fn to_error_info(&self) -> ErrorInfo {
        use crate::protocol::codes;
        match self {
            RealtimeError::Protocol(info) => info.clone(),
            RealtimeError::Timeout(msg) => ErrorInfo::timeout(msg.clone()),
            RealtimeError::AuthenticationFailed(msg) => ErrorInfo::auth_provider_failed(msg.clone()),
            RealtimeError::WebSocket(msg) | RealtimeError::ConnectionClosed(msg) => {
                ErrorInfo::connection_failed(msg.clone())
            }
            RealtimeError::InvalidState(msg) => ErrorInfo::invalid_channel_state(msg.clone()),
            other => ErrorInfo::new(codes::INTERNAL_ERROR, 500, other.to_string()),
        }
    }
}

/// Result type for realtime-core operations
pub type Result<T> = std::result::Result<T, RealtimeError>;
