use crate::core::builder::{states::NoCredentials, RealtimeClientBuilder};
use crate::core::channel::{Channel, ChannelShared};
use crate::core::config::ClientOptions;
use crate::core::connection::command::Command;
use crate::core::connection::engine::{ChannelRegistry, Engine, EngineParts};
use crate::core::connection::{Connection, ConnectionShared, Metrics};
use crate::error::{RealtimeError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

/// Realtime client: one logical connection plus the channels multiplexed
/// over it
///
/// The connection and every channel are driven by a single engine task
/// spawned at build time. Handles returned by `connection()` and `channels()`
/// are cheap to clone and safe to use from any task.
pub struct RealtimeClient {
    options: Arc<ClientOptions>,
    connection: Connection,
    channels: Channels,
    inbox: UnboundedSender<Command>,
    task_handle: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    pub fn builder() -> RealtimeClientBuilder<NoCredentials> {
        RealtimeClientBuilder::new()
    }

    pub(crate) fn start(name: String, parts: EngineParts, runtime: &tokio::runtime::Handle) -> Self {
        let options = Arc::clone(&parts.options);
        let shared = Arc::new(ConnectionShared::new());
        let registry: ChannelRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (inbox, rx) = mpsc::unbounded_channel();

        let engine = Engine::new(parts, Arc::clone(&shared), Arc::clone(&registry), inbox.clone());
        let span = info_span!("realtime", client = %name);
        let task_handle = runtime.spawn(engine.run(rx).instrument(span));

        if options.auto_connect {
            let _ = inbox.send(Command::Connect);
        }
        info!("Realtime client {} started (host: {})", name, options.primary_host());

        Self {
            connection: Connection::new(Arc::clone(&shared), inbox.clone()),
            channels: Channels {
                registry,
                connection: shared,
                inbox: inbox.clone(),
            },
            options,
            inbox,
            task_handle: Some(task_handle),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Shorthand for `channels().get(name)`
    pub fn channel(&self, name: &str) -> Channel {
        self.channels.get(name)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    pub fn close(&self) -> Result<()> {
        self.connection.close()
    }

    pub async fn metrics(&self) -> Metrics {
        self.connection.metrics().await
    }

    /// Close the connection, fail everything outstanding and stop the engine
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down realtime client");
        let _ = self.inbox.send(Command::Shutdown);
        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| RealtimeError::Other(format!("engine task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if self.task_handle.take().is_some() {
            debug!("Client dropped, stopping engine");
            let _ = self.inbox.send(Command::Shutdown);
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("connection", &self.connection)
            .field("channels", &self.channels.names())
            .finish()
    }
}

/// Registry of the client's channels, keyed by name
#[derive(Clone)]
pub struct Channels {
    registry: ChannelRegistry,
    connection: Arc<ConnectionShared>,
    inbox: UnboundedSender<Command>,
}

impl Channels {
    /// The channel called `name`, created on first use
    pub fn get(&self, name: &str) -> Channel {
        let mut registry = self.registry.lock();
        if let Some(channel) = registry.get(name) {
            return channel.clone();
        }
        let shared = Arc::new(ChannelShared::new(name));
        let channel = Channel::new(
            Arc::clone(&shared),
            Arc::clone(&self.connection),
            self.inbox.clone(),
        );
        registry.insert(name.to_string(), channel.clone());
        let _ = self.inbox.send(Command::AddChannel(shared));
        channel
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Detach `name` and drop it from the registry once it is detached
    pub fn release(&self, name: &str) -> Result<()> {
        self.inbox
            .send(Command::Release {
                channel: name.to_string(),
            })
            .map_err(|e| RealtimeError::ChannelSend(e.to_string()))
    }
}
