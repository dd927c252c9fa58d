pub mod states;

use crate::core::auth_coordinator::AuthCoordinator;
use crate::core::client::RealtimeClient;
use crate::core::config::{validate_key, ClientOptions};
use crate::core::connection::engine::EngineParts;
use crate::core::policy::ReconnectionPolicy;
use crate::core::websocket::WebSocketTransportFactory;
use crate::error::{RealtimeError, Result};
use crate::traits::*;
use futures::future::BoxFuture;
use states::*;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-state builder for `RealtimeClient`
///
/// Options default to `ClientOptions::default()`. A credential source is
/// required before `build` becomes available; everything else (transport,
/// connectivity probe, retry strategies) has a production default and can be
/// swapped out for tests or custom deployments.
pub struct RealtimeClientBuilder<C: CredentialState> {
    _state: PhantomData<C>,
    name: String,
    options: ClientOptions,
    auth: Option<Arc<dyn AuthProvider>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    connectivity_probe: Option<Arc<dyn ConnectivityProbe>>,
    disconnected_strategy: Option<Arc<dyn ReconnectionStrategy>>,
    suspended_strategy: Option<Arc<dyn ReconnectionStrategy>>,
}

impl<C: CredentialState> RealtimeClientBuilder<C> {
    fn with_state<N: CredentialState>(self) -> RealtimeClientBuilder<N> {
        RealtimeClientBuilder {
            _state: PhantomData,
            name: self.name,
            options: self.options,
            auth: self.auth,
            transport_factory: self.transport_factory,
            connectivity_probe: self.connectivity_probe,
            disconnected_strategy: self.disconnected_strategy,
            suspended_strategy: self.suspended_strategy,
        }
    }

    /// Name used in the engine's tracing span
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace all options; credentials set on the builder are kept
    pub fn options(mut self, options: ClientOptions) -> Self {
        let key = self.options.key.take();
        let token = self.options.token.take();
        self.options = options;
        self.options.key = self.options.key.take().or(key);
        self.options.token = self.options.token.take().or(token);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = Some(client_id.into());
        self
    }

    /// Connect to a custom host; fallback hosts are disabled
    pub fn realtime_host(mut self, host: impl Into<String>) -> Self {
        self.options.realtime_host = Some(host.into());
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.options.auto_connect = auto_connect;
        self
    }

    /// Resume the connection of a previous client (`connectionKey:connectionSerial`)
    pub fn recover(mut self, recovery_key: impl Into<String>) -> Self {
        self.options.recover = Some(recovery_key.into());
        self
    }

    pub fn transport_factory<F>(mut self, factory: F) -> Self
    where
        F: TransportFactory + 'static,
    {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    pub fn connectivity_probe<P>(mut self, probe: P) -> Self
    where
        P: ConnectivityProbe + 'static,
    {
        self.connectivity_probe = Some(Arc::new(probe));
        self
    }

    /// Delay strategy while `Disconnected` (default: exponential backoff)
    pub fn disconnected_retry_strategy<S>(mut self, strategy: S) -> Self
    where
        S: ReconnectionStrategy + 'static,
    {
        self.disconnected_strategy = Some(Arc::new(strategy));
        self
    }

    /// Delay strategy while `Suspended` (default: fixed delay)
    pub fn suspended_retry_strategy<S>(mut self, strategy: S) -> Self
    where
        S: ReconnectionStrategy + 'static,
    {
        self.suspended_strategy = Some(Arc::new(strategy));
        self
    }
}

impl RealtimeClientBuilder<NoCredentials> {
    pub fn new() -> Self {
        Self {
            _state: PhantomData,
            name: "realtime".to_string(),
            options: ClientOptions::default(),
            auth: None,
            transport_factory: None,
            connectivity_probe: None,
            disconnected_strategy: None,
            suspended_strategy: None,
        }
    }

    /// Builder seeded from loaded options, taking credentials from `key` or
    /// `token`
    pub fn from_options(options: ClientOptions) -> Result<RealtimeClientBuilder<HasCredentials>> {
        options
            .validate()
            .map_err(|e| RealtimeError::Configuration(e.to_string()))?;
        let auth: Arc<dyn AuthProvider> = match (&options.key, &options.token) {
            (Some(key), _) => Arc::new(KeyAuth::new(key.clone())),
            (None, Some(token)) => Arc::new(StaticTokenAuth::new(TokenDetails::new(token.clone()))),
            (None, None) => {
                return Err(RealtimeError::Configuration(
                    "either key or token must be provided".into(),
                ))
            }
        };
        let mut builder = Self::new().with_state::<HasCredentials>();
        builder.options = options;
        builder.auth = Some(auth);
        Ok(builder)
    }

    /// Basic authentication with an API key
    pub fn key(mut self, key: impl Into<String>) -> RealtimeClientBuilder<HasCredentials> {
        let key = key.into();
        self.options.key = Some(key.clone());
        self.auth = Some(Arc::new(KeyAuth::new(key)));
        self.with_state()
    }

    /// A fixed token; the connection fails once the service rejects it
    pub fn token(mut self, token: TokenDetails) -> RealtimeClientBuilder<HasCredentials> {
        self.options.token = Some(token.token.clone());
        self.auth = Some(Arc::new(StaticTokenAuth::new(token)));
        self.with_state()
    }

    /// Tokens issued by `callback`, renewed whenever the service rejects one
    pub fn auth_callback<F>(mut self, callback: F) -> RealtimeClientBuilder<HasCredentials>
    where
        F: Fn() -> BoxFuture<'static, Result<TokenDetails>> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(TokenCallbackAuth::new(callback)));
        self.with_state()
    }

    pub fn auth_provider<A>(mut self, provider: A) -> RealtimeClientBuilder<HasCredentials>
    where
        A: AuthProvider + 'static,
    {
        self.auth = Some(Arc::new(provider));
        self.with_state()
    }
}

impl Default for RealtimeClientBuilder<NoCredentials> {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeClientBuilder<HasCredentials> {
    /// Validate the options and start the client on the current tokio runtime
    pub fn build(self) -> Result<RealtimeClient> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            RealtimeError::Configuration("build() must be called within a tokio runtime".into())
        })?;
        self.build_on(&handle)
    }

    /// Start the client's engine on `handle`
    pub fn build_on(self, handle: &tokio::runtime::Handle) -> Result<RealtimeClient> {
        let options = self.options;
        options
            .validate_timeouts()
            .map_err(|e| RealtimeError::Configuration(e.to_string()))?;
        if let Some(key) = &options.key {
            validate_key(key).map_err(|e| RealtimeError::Configuration(e.to_string()))?;
        }
        let auth = self.auth.ok_or_else(|| {
            RealtimeError::Configuration("no credential source configured".into())
        })?;

        let mut policy = ReconnectionPolicy::new(&options);
        if self.disconnected_strategy.is_some() || self.suspended_strategy.is_some() {
            let defaults = ReconnectionPolicy::default_strategies(&options);
            policy = policy.with_strategies(
                self.disconnected_strategy.unwrap_or(defaults.0),
                self.suspended_strategy.unwrap_or(defaults.1),
            );
        }

        let probe = self.connectivity_probe.unwrap_or_else(|| {
            Arc::new(HttpConnectivityProbe::new(
                options.connectivity_check_url.clone(),
                options.realtime_request_timeout(),
            ))
        });

        let parts = EngineParts {
            factory: self
                .transport_factory
                .unwrap_or_else(|| Arc::new(WebSocketTransportFactory)),
            auth: AuthCoordinator::new(auth, options.auth_timeout()),
            probe,
            policy,
            options: Arc::new(options),
        };
        Ok(RealtimeClient::start(self.name, parts, handle))
    }
}
