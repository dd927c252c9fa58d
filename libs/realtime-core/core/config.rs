use crate::protocol::Format;
use crate::traits::DEFAULT_CONNECTIVITY_CHECK_URL;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Primary realtime endpoint used when no custom host is configured
pub const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";

/// Fallback endpoints tried when the default host is unreachable
pub const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.ably-realtime.com",
    "b.ably-realtime.com",
    "c.ably-realtime.com",
    "d.ably-realtime.com",
    "e.ably-realtime.com",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Client options
///
/// Loadable from YAML; every field has a default so a config file only needs
/// the values it overrides. Durations are stored in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// API key (`appId.keyId:secret`); prefer env `REALTIME_KEY` over YAML
    pub key: Option<String>,
    /// Pre-issued access token; env `REALTIME_TOKEN`
    pub token: Option<String>,
    pub client_id: Option<String>,

    /// Custom host; disables fallback hosts
    pub realtime_host: Option<String>,
    /// Overrides the default fallback host list
    pub fallback_hosts: Option<Vec<String>>,
    pub port: u16,
    pub tls_port: u16,
    pub tls: bool,
    pub format: Format,

    pub echo_messages: bool,
    pub auto_connect: bool,
    /// Queue outbound messages while not connected instead of failing them
    pub queue_messages: bool,
    /// Recovery key (`connectionKey:connectionSerial`) from a previous client
    pub recover: Option<String>,

    pub realtime_request_timeout_ms: u64,
    pub disconnected_retry_timeout_ms: u64,
    pub max_retry_delay_ms: u64,
    pub suspended_retry_timeout_ms: u64,
    pub connection_state_ttl_ms: u64,
    pub auth_timeout_ms: u64,

    pub connectivity_check_url: String,

    /// Log level (error, warn, info, debug, trace) used by the binaries
    pub log_level: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            realtime_host: None,
            fallback_hosts: None,
            port: 80,
            tls_port: 443,
            tls: true,
            format: Format::Json,
            echo_messages: true,
            auto_connect: true,
            queue_messages: true,
            recover: None,
            realtime_request_timeout_ms: 10_000,
            disconnected_retry_timeout_ms: 15_000,
            max_retry_delay_ms: 60_000,
            suspended_retry_timeout_ms: 30_000,
            connection_state_ttl_ms: 120_000,
            auth_timeout_ms: 10_000,
            connectivity_check_url: DEFAULT_CONNECTIVITY_CHECK_URL.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Load options from a YAML file, then apply environment overrides
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut options = Self::from_yaml_str(&yaml_content)?;
        options.apply_env_overrides();
        options.validate()?;
        info!(
            "Loaded client options (host: {}, tls: {})",
            options.primary_host(),
            options.tls
        );
        Ok(options)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Secrets come from the environment when present
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("REALTIME_KEY") {
            self.key = Some(key);
        }
        if let Ok(token) = std::env::var("REALTIME_TOKEN") {
            self.token = Some(token);
        }
        if let Ok(client_id) = std::env::var("REALTIME_CLIENT_ID") {
            self.client_id = Some(client_id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.is_none() && self.token.is_none() {
            return Err(ConfigError::ValidationError(
                "either key or token must be provided".into(),
            ));
        }
        if let Some(key) = &self.key {
            validate_key(key)?;
        }
        self.validate_timeouts()
    }

    /// Timing checks only; credentials may come from an auth provider
    pub fn validate_timeouts(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("realtime_request_timeout_ms", self.realtime_request_timeout_ms),
            ("disconnected_retry_timeout_ms", self.disconnected_retry_timeout_ms),
            ("suspended_retry_timeout_ms", self.suspended_retry_timeout_ms),
            ("connection_state_ttl_ms", self.connection_state_ttl_ms),
            ("auth_timeout_ms", self.auth_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{} must be > 0", name)));
            }
        }
        if self.max_retry_delay_ms < self.disconnected_retry_timeout_ms {
            return Err(ConfigError::ValidationError(
                "max_retry_delay_ms must be >= disconnected_retry_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    /// Host for the first attempt in every sequence
    pub fn primary_host(&self) -> &str {
        self.realtime_host.as_deref().unwrap_or(DEFAULT_REALTIME_HOST)
    }

    pub fn is_custom_host(&self) -> bool {
        self.realtime_host.is_some()
    }

    /// Fallback hosts in configured order; empty for a custom host
    pub fn fallback_hosts(&self) -> Vec<String> {
        if self.is_custom_host() {
            return Vec::new();
        }
        match &self.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None => DEFAULT_FALLBACK_HOSTS.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.tls {
            self.tls_port
        } else {
            self.port
        }
    }

    pub fn realtime_request_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_request_timeout_ms)
    }

    pub fn disconnected_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_timeout_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn suspended_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.suspended_retry_timeout_ms)
    }

    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_state_ttl_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

/// API keys have the form `appId.keyId:secret`
pub fn validate_key(key: &str) -> Result<(), ConfigError> {
    if !key.contains(':') {
        return Err(ConfigError::ValidationError(
            "key must have the form `keyName:keySecret`".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_with_key() {
        let options = ClientOptions::with_key("app.key:secret");
        assert!(options.validate().is_ok());
        assert_eq!(options.primary_host(), DEFAULT_REALTIME_HOST);
        assert_eq!(options.fallback_hosts().len(), 5);
        assert_eq!(options.effective_port(), 443);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = ClientOptions::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_custom_host_has_no_fallbacks() {
        let options = ClientOptions {
            realtime_host: Some("realtime.internal".into()),
            fallback_hosts: Some(vec!["ignored.example".into()]),
            ..ClientOptions::with_key("a.b:c")
        };
        assert!(options.is_custom_host());
        assert!(options.fallback_hosts().is_empty());
    }

    #[test]
    fn test_yaml_overrides_only_given_fields() {
        let yaml = r#"
key: "app.key:secret"
tls: false
connection_state_ttl_ms: 5000
fallback_hosts: ["x.example", "y.example"]
"#;
        let options = ClientOptions::from_yaml_str(yaml).unwrap();
        assert_eq!(options.connection_state_ttl(), Duration::from_millis(5000));
        assert_eq!(options.effective_port(), 80);
        assert_eq!(options.fallback_hosts(), vec!["x.example", "y.example"]);
        assert_eq!(options.realtime_request_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "token: abc123").unwrap();
        writeln!(file, "auto_connect: false").unwrap();

        let options = ClientOptions::load(file.path()).unwrap();
        assert!(!options.auto_connect);
        assert!(options.token.is_some());
        assert!(matches!(
            ClientOptions::load("/nonexistent/realtime.yaml"),
            Err(ConfigError::FileError(_))
        ));
    }

    #[test]
    fn test_key_format() {
        assert!(validate_key("app.key:secret").is_ok());
        assert!(validate_key("app.key").is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let options = ClientOptions {
            realtime_request_timeout_ms: 0,
            ..ClientOptions::with_key("a.b:c")
        };
        assert!(options.validate().is_err());
    }
}
