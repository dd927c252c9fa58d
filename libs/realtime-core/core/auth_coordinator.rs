//! Bridges token renewal with the connection engine
//!
//! The coordinator hands out futures; the engine spawns them and receives the
//! outcome as a command, so a slow auth provider never stalls the engine.
//! Every provider call is bounded by the auth timeout.

use crate::protocol::ErrorInfo;
use crate::traits::{AuthCredential, AuthProvider};
use futures::future::{self, BoxFuture};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type CredentialResult = Result<AuthCredential, ErrorInfo>;

pub struct AuthCoordinator {
    provider: Arc<dyn AuthProvider>,
    timeout: Duration,
    renewing: bool,
    /// Fresh credential to use for the next attempt
    renewed: Option<AuthCredential>,
}

impl AuthCoordinator {
    pub fn new(provider: Arc<dyn AuthProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            renewing: false,
            renewed: None,
        }
    }

    pub fn can_renew(&self) -> bool {
        self.provider.can_renew()
    }

    pub fn is_renewing(&self) -> bool {
        self.renewing
    }

    /// Credential for the next connection attempt
    pub fn credential(&mut self) -> BoxFuture<'static, CredentialResult> {
        if let Some(credential) = self.renewed.take() {
            return Box::pin(future::ready(Ok(credential)));
        }
        let provider = Arc::clone(&self.provider);
        let timeout = self.timeout;
        Box::pin(async move {
            bounded(timeout, "credential lookup", provider.current_credential()).await
        })
    }

    /// Start a renewal unless one is already running
    pub fn begin_renewal(&mut self) -> Option<BoxFuture<'static, CredentialResult>> {
        if self.renewing {
            debug!("Token renewal already in progress");
            return None;
        }
        self.renewing = true;
        let provider = Arc::clone(&self.provider);
        let timeout = self.timeout;
        Some(Box::pin(async move {
            bounded(timeout, "token renewal", provider.authorize()).await
        }))
    }

    pub fn complete_renewal(&mut self, result: &CredentialResult) {
        self.renewing = false;
        match result {
            Ok(credential) => self.renewed = Some(credential.clone()),
            Err(error) => warn!("Token renewal failed: {}", error),
        }
    }
}

async fn bounded<F>(timeout: Duration, what: &str, operation: F) -> CredentialResult
where
    F: std::future::Future<Output = crate::error::Result<AuthCredential>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(credential)) => Ok(credential),
        Ok(Err(error)) => Err(error
            .error_info()
            .cloned()
            .unwrap_or_else(|| ErrorInfo::auth_provider_failed(error.to_string()))),
        Err(_) => Err(ErrorInfo::auth_provider_failed(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}
