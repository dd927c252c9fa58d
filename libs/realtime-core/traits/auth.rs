use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// An issued access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            issued: None,
            client_id: None,
        }
    }

    pub fn with_expiry(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Tokens without an expiry never expire locally
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(false, |expires| expires <= now)
    }
}

/// Credential placed in the connection query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCredential {
    /// `key=` basic credential
    Key(String),
    /// `access_token=` token credential
    Token(TokenDetails),
}

/// Authentication collaborator used by the connection engine
///
/// The engine calls `current_credential` before every connection attempt and
/// `authorize` when the service rejects the current token.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Return a credential that is valid now, renewing a token if it expired
    async fn current_credential(&self) -> Result<AuthCredential>;

    /// Force a new token to be obtained
    async fn authorize(&self) -> Result<AuthCredential>;

    /// Whether `authorize` can produce a new credential at all
    fn can_renew(&self) -> bool {
        true
    }
}

/// Basic authentication with an API key; cannot be renewed
pub struct KeyAuth {
    key: String,
}

impl KeyAuth {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl AuthProvider for KeyAuth {
    async fn current_credential(&self) -> Result<AuthCredential> {
        Ok(AuthCredential::Key(self.key.clone()))
    }

    async fn authorize(&self) -> Result<AuthCredential> {
        Err(RealtimeError::AuthenticationFailed(
            "basic key authentication cannot be renewed".into(),
        ))
    }

    fn can_renew(&self) -> bool {
        false
    }
}

/// A fixed token with no means of renewal
pub struct StaticTokenAuth {
    token: TokenDetails,
}

impl StaticTokenAuth {
    pub fn new(token: TokenDetails) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn current_credential(&self) -> Result<AuthCredential> {
        if self.token.is_expired_at(Utc::now()) {
            return Err(RealtimeError::AuthenticationFailed(
                "token expired and no means to renew".into(),
            ));
        }
        Ok(AuthCredential::Token(self.token.clone()))
    }

    async fn authorize(&self) -> Result<AuthCredential> {
        Err(RealtimeError::AuthenticationFailed(
            "static token cannot be renewed".into(),
        ))
    }

    fn can_renew(&self) -> bool {
        false
    }
}

/// Boxed async callback that issues a new token
pub type TokenCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<TokenDetails>> + Send + Sync>;

/// Token authentication backed by a user-supplied token callback
///
/// Caches the last token and only invokes the callback when there is no token,
/// the cached one expired, or renewal is forced.
pub struct TokenCallbackAuth {
    callback: TokenCallback,
    cached: Mutex<Option<TokenDetails>>,
}

impl TokenCallbackAuth {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<TokenDetails>> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            cached: Mutex::new(None),
        }
    }

    pub fn with_initial_token(self, token: TokenDetails) -> Self {
        *self.cached.lock() = Some(token);
        self
    }

    async fn request_token(&self) -> Result<AuthCredential> {
        debug!("Requesting new token from callback");
        let token = (self.callback)().await?;
        *self.cached.lock() = Some(token.clone());
        Ok(AuthCredential::Token(token))
    }
}

#[async_trait]
impl AuthProvider for TokenCallbackAuth {
    async fn current_credential(&self) -> Result<AuthCredential> {
        let cached = self.cached.lock().clone();
        match cached {
            Some(token) if !token.is_expired_at(Utc::now()) => Ok(AuthCredential::Token(token)),
            _ => self.request_token().await,
        }
    }

    async fn authorize(&self) -> Result<AuthCredential> {
        self.request_token().await
    }
}
