//! The logical connection and its public handle
//!
//! All connection state is owned by the engine task (`engine.rs`). The
//! `Connection` handle talks to it through the command inbox and reads the
//! mirrors in `ConnectionShared` for synchronous queries.

pub(crate) mod command;
pub(crate) mod engine;

use crate::core::connection_state::{
    AtomicConnectionState, AtomicMetrics, ConnectionState, ConnectionStateChange,
};
use crate::core::events::{EventEmitter, Subscription};
use crate::error::{RealtimeError, Result};
use crate::protocol::ErrorInfo;
use command::Command;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// Client-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionStateChange),
    /// A new credential was obtained
    AuthUpdated,
    /// An error absorbed by the engine
    Error(ErrorInfo),
}

/// Client metrics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnect_count: u64,
    pub pending_acks: usize,
    pub queued_messages: usize,
    pub connection_state: ConnectionState,
}

/// Identity assigned by the service in `Connected`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub id: Option<String>,
    pub key: Option<String>,
    pub serial: Option<i64>,
    pub client_id: Option<String>,
}

pub(crate) struct ConnectionShared {
    pub(crate) state: AtomicConnectionState,
    pub(crate) identity: Mutex<ConnectionIdentity>,
    pub(crate) error_reason: Mutex<Option<ErrorInfo>>,
    pub(crate) state_changes: EventEmitter<ConnectionStateChange>,
    pub(crate) events: EventEmitter<ClientEvent>,
    pub(crate) metrics: AtomicMetrics,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicConnectionState::new(ConnectionState::Initialized),
            identity: Mutex::new(ConnectionIdentity::default()),
            error_reason: Mutex::new(None),
            state_changes: EventEmitter::new(),
            events: EventEmitter::new(),
            metrics: AtomicMetrics::new(),
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    inbox: UnboundedSender<Command>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnectionShared>, inbox: UnboundedSender<Command>) -> Self {
        Self { shared, inbox }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn id(&self) -> Option<String> {
        self.shared.identity.lock().id.clone()
    }

    pub fn key(&self) -> Option<String> {
        self.shared.identity.lock().key.clone()
    }

    pub fn serial(&self) -> Option<i64> {
        self.shared.identity.lock().serial
    }

    /// `connectionKey:connectionSerial`, usable as the `recover` option of
    /// another client
    pub fn recovery_key(&self) -> Option<String> {
        let identity = self.shared.identity.lock();
        let key = identity.key.as_ref()?;
        Some(format!("{}:{}", key, identity.serial.unwrap_or(-1)))
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.error_reason.lock().clone()
    }

    pub fn on_state_change(&self) -> Subscription<ConnectionStateChange> {
        self.shared.state_changes.subscribe()
    }

    pub fn events(&self) -> Subscription<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Start connecting; the outcome is reported through state changes
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    /// Wait until the connection reaches `target`
    pub async fn when_state(&self, target: ConnectionState) -> Result<ConnectionStateChange> {
        let mut changes = self.on_state_change();
        let current = self.state();
        if current == target {
            return Ok(ConnectionStateChange {
                previous: current,
                current,
                reason: self.error_reason(),
                retry_in: None,
            });
        }
        while let Some(change) = changes.recv().await {
            if change.current == target {
                return Ok(change);
            }
        }
        Err(RealtimeError::ChannelSend("engine stopped".into()))
    }

    /// Round-trip a heartbeat through the service
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Ping(tx))?;
        rx.await
            .map_err(|_| RealtimeError::ChannelSend("engine stopped".into()))?
    }

    /// Obtain a new token and apply it to the live connection
    pub async fn authorize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Authorize(tx))?;
        rx.await
            .map_err(|_| RealtimeError::ChannelSend("engine stopped".into()))?
    }

    pub async fn metrics(&self) -> Metrics {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Metrics(tx)).is_ok() {
            if let Ok(metrics) = rx.await {
                return metrics;
            }
        }
        Metrics {
            messages_sent: self.shared.metrics.messages_sent(),
            messages_received: self.shared.metrics.messages_received(),
            reconnect_count: self.shared.metrics.reconnect_count(),
            pending_acks: 0,
            queued_messages: 0,
            connection_state: self.state(),
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inbox
            .send(command)
            .map_err(|e| RealtimeError::ChannelSend(e.to_string()))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("id", &self.id())
            .finish()
    }
}
