//! Named channels multiplexed over the connection
//!
//! `Channel` is a cheap, cloneable handle. Its state machine runs inside the
//! connection engine; the handle reads lock-free mirrors for queries and
//! sends commands for everything else.

pub mod state;
pub(crate) mod state_machine;

pub use state::{AtomicChannelState, ChannelState, ChannelStateChange};

use crate::core::ack::AckCallback;
use crate::core::connection::command::Command;
use crate::core::connection::ConnectionShared;
use crate::core::events::{EventEmitter, Subscription};
use crate::error::{RealtimeError, Result};
use crate::protocol::{ErrorInfo, Message, PresenceMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// State shared between a channel handle and its engine-side state machine
pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) state: AtomicChannelState,
    pub(crate) error_reason: Mutex<Option<ErrorInfo>>,
    pub(crate) state_changes: EventEmitter<ChannelStateChange>,
    pub(crate) messages: EventEmitter<Message>,
    pub(crate) presence: EventEmitter<PresenceMessage>,
    pub(crate) presence_sync: AtomicBool,
}

impl ChannelShared {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicChannelState::new(ChannelState::Initialized),
            error_reason: Mutex::new(None),
            state_changes: EventEmitter::new(),
            messages: EventEmitter::new(),
            presence: EventEmitter::new(),
            presence_sync: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    connection: Arc<ConnectionShared>,
    inbox: UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        connection: Arc<ConnectionShared>,
        inbox: UnboundedSender<Command>,
    ) -> Self {
        Self {
            shared,
            connection,
            inbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.shared.state.get()
    }

    /// Error behind the most recent failed or forced transition
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.error_reason.lock().clone()
    }

    /// True between an `Attached` that announced presence and the end of the
    /// following sync
    pub fn is_presence_sync_in_progress(&self) -> bool {
        self.shared.presence_sync.load(Ordering::Acquire)
    }

    pub fn on_state_change(&self) -> Subscription<ChannelStateChange> {
        self.shared.state_changes.subscribe()
    }

    /// Messages received on this channel while attached
    pub fn subscribe(&self) -> Subscription<Message> {
        self.shared.messages.subscribe()
    }

    pub fn subscribe_presence(&self) -> Subscription<PresenceMessage> {
        self.shared.presence.subscribe()
    }

    /// Attach and wait for the service to confirm
    pub async fn attach(&self) -> Result<()> {
        let connection = self.connection.state.get();
        if connection.rejects_channel_operations() {
            return Err(ErrorInfo::invalid_channel_state(format!(
                "Cannot attach channel {} while connection is {}",
                self.name(),
                connection
            ))
            .into());
        }
        let (tx, rx) = oneshot::channel();
        self.command(Command::Attach {
            channel: Arc::clone(&self.shared),
            reply: Some(tx),
        })?;
        rx.await
            .map_err(|_| RealtimeError::ChannelSend("engine stopped".into()))?
    }

    /// Detach and wait for the service to confirm
    pub async fn detach(&self) -> Result<()> {
        if self.state() == ChannelState::Failed {
            return Err(RealtimeError::InvalidState(format!(
                "Cannot detach channel {} in failed state",
                self.name()
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.command(Command::Detach {
            channel: Arc::clone(&self.shared),
            reply: Some(tx),
        })?;
        rx.await
            .map_err(|_| RealtimeError::ChannelSend("engine stopped".into()))?
    }

    /// Queue messages for publishing; the callback fires on ACK or NACK
    ///
    /// Invalid calls fail here; everything after acceptance is reported
    /// through the callback.
    pub fn publish_with_callback(
        &self,
        messages: Vec<Message>,
        callback: Option<AckCallback>,
    ) -> Result<()> {
        let connection = self.connection.state.get();
        if connection.rejects_channel_operations() {
            return Err(ErrorInfo::invalid_channel_state(format!(
                "Cannot publish while connection is {}",
                connection
            ))
            .into());
        }
        let state = self.state();
        if matches!(state, ChannelState::Failed | ChannelState::Detaching) {
            return Err(RealtimeError::InvalidState(format!(
                "Cannot publish on channel {} while {}",
                self.name(),
                state
            )));
        }
        self.command(Command::Publish {
            channel: Arc::clone(&self.shared),
            messages,
            callback,
        })
    }

    /// Publish one message and wait for its acknowledgement
    pub async fn publish(&self, name: impl Into<String>, data: impl Into<Value>) -> Result<()> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let callback: AckCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.publish_with_callback(messages, Some(callback))?;
        rx.await
            .map_err(|_| RealtimeError::ChannelSend("engine stopped".into()))?
            .map_err(RealtimeError::from)
    }

    /// Wait until the channel reaches `target`
    pub async fn when_state(&self, target: ChannelState) -> Result<()> {
        let mut changes = self.on_state_change();
        if self.state() == target {
            return Ok(());
        }
        while let Some(change) = changes.recv().await {
            if change.current == target {
                return Ok(());
            }
        }
        Err(RealtimeError::ChannelSend("engine stopped".into()))
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inbox
            .send(command)
            .map_err(|e| RealtimeError::ChannelSend(e.to_string()))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}
