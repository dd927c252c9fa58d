use crate::protocol::{Format, PROTOCOL_VERSION};
use crate::traits::{AuthCredential, RealtimeError, Result};
use url::Url;

/// Resume token for continuing a previous connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub connection_key: String,
    pub connection_serial: Option<i64>,
}

/// Everything a transport needs for one connection attempt
///
/// Built fresh by the engine for every attempt and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub format: Format,
    pub credential: AuthCredential,
    pub client_id: Option<String>,
    pub echo: bool,
    /// Resume a connection this client held before the drop
    pub resume: Option<ResumeToken>,
    /// Recovery key handed over from another client instance
    pub recover: Option<String>,
}

impl TransportParams {
    /// Query-string parameters in the order they are sent
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("v", PROTOCOL_VERSION.to_string()),
            ("format", self.format.as_str().to_string()),
        ];
        if !self.echo {
            pairs.push(("echo", "false".to_string()));
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("clientId", client_id.clone()));
        }

        if let Some(resume) = &self.resume {
            pairs.push(("resume", resume.connection_key.clone()));
            if let Some(serial) = resume.connection_serial {
                pairs.push(("connection_serial", serial.to_string()));
            }
        } else if let Some(recover) = &self.recover {
            match parse_recovery_key(recover) {
                Some((key, serial)) => {
                    pairs.push(("recover", key.to_string()));
                    pairs.push(("connection_serial", serial.to_string()));
                }
                None => pairs.push(("recover", recover.clone())),
            }
        }

        match &self.credential {
            AuthCredential::Key(key) => pairs.push(("key", key.clone())),
            AuthCredential::Token(token) => pairs.push(("access_token", token.token.clone())),
        }
        pairs
    }

    /// Full WebSocket URL for this attempt
    pub fn url(&self) -> Result<Url> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| RealtimeError::Configuration(format!("Invalid host {}: {}", self.host, e)))?;
        url.query_pairs_mut().extend_pairs(self.query_pairs());
        Ok(url)
    }
}

/// Split a `connectionKey:connectionSerial` recovery key
pub fn parse_recovery_key(recover: &str) -> Option<(&str, i64)> {
    let (key, serial) = recover.rsplit_once(':')?;
    if key.is_empty() {
        return None;
    }
    serial.parse().ok().map(|serial| (key, serial))
}
