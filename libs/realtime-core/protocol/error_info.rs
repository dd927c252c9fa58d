use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known error codes used by the engine
pub mod codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const TOKEN_ERROR_FIRST: u32 = 40140;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const TOKEN_ERROR_LAST: u32 = 40149;
    pub const INTERNAL_ERROR: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const AUTH_PROVIDER_FAILED: u32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    pub const INVALID_CHANNEL_STATE: u32 = 90001;
    pub const CHANNEL_NO_RESPONSE: u32 = 90007;
    pub const NACK_RECEIVED: u32 = 50001;
}

/// Protocol-level error carried by `Error`, `Nack`, `Disconnected` and
/// `Detached` messages, and attached to every failed state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            href: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, 504, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_FAILED, 503, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, 503, message)
    }

    pub fn suspended() -> Self {
        Self::new(
            codes::CONNECTION_SUSPENDED,
            503,
            "Connection to server unavailable",
        )
    }

    pub fn closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, 400, "Connection closed")
    }

    pub fn invalid_channel_state(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_CHANNEL_STATE, 400, message)
    }

    pub fn auth_provider_failed(message: impl Into<String>) -> Self {
        Self::new(codes::AUTH_PROVIDER_FAILED, 401, message)
    }

    /// Token errors are recoverable by renewing the credential
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_FIRST..=codes::TOKEN_ERROR_LAST).contains(&self.code)
    }

    /// 5xx-class errors are retried, everything else is fatal
    pub fn is_retryable(&self) -> bool {
        (500..=599).contains(&self.status_code)
    }

    /// Only 500–504 may move the client onto a fallback host
    pub fn is_fallback_eligible(&self) -> bool {
        (500..=504).contains(&self.status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let token = ErrorInfo::new(codes::TOKEN_EXPIRED, 401, "expired");
        assert!(token.is_token_error());
        assert!(!token.is_retryable());

        let unavailable = ErrorInfo::new(50300, 503, "unavailable");
        assert!(unavailable.is_retryable());
        assert!(unavailable.is_fallback_eligible());

        let gateway_timeout = ErrorInfo::new(50400, 504, "gateway");
        assert!(gateway_timeout.is_fallback_eligible());

        let not_implemented = ErrorInfo::new(50500, 505, "version");
        assert!(not_implemented.is_retryable());
        assert!(!not_implemented.is_fallback_eligible());

        let forbidden = ErrorInfo::new(40300, 403, "forbidden");
        assert!(!forbidden.is_retryable());
        assert!(!forbidden.is_token_error());
    }

    #[test]
    fn test_deserialize_partial_error() {
        let err: ErrorInfo = serde_json::from_str(r#"{"code":40142,"statusCode":401}"#).unwrap();
        assert_eq!(err.code, 40142);
        assert_eq!(err.status_code, 401);
        assert!(err.message.is_empty());
    }
}
