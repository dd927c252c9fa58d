//! Per-channel attach/detach state machine
//!
//! A `ChannelCore` lives inside the connection engine and is only touched from
//! the engine task. It reaches the connection through `ChannelLink`, which
//! keeps the channel logic independent of transports and timers.

use super::state::{ChannelState, ChannelStateChange};
use super::ChannelShared;
use crate::core::ack::AckCallback;
use crate::core::connection::command::Reply;
use crate::core::connection_state::ConnectionState;
use crate::core::timer::{take_if_current, TimerHandle};
use crate::error::{RealtimeError, Result};
use crate::protocol::{codes, flags, Action, ErrorInfo, Message, ProtocolMessage};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded waits a channel can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelTimer {
    Attach,
    Detach,
}

/// What a channel needs from the connection that owns it
pub trait ChannelLink {
    fn connection_state(&self) -> ConnectionState;

    /// Hand an envelope to the connection; failures arrive through `callback`
    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>);

    /// Arm a timer that reports back as `(channel, timer, id)`
    fn schedule(&mut self, channel: &str, timer: ChannelTimer, delay: Duration) -> TimerHandle;

    fn request_timeout(&self) -> Duration;
}

struct QueuedPublish {
    messages: Vec<Message>,
    callback: Option<AckCallback>,
}

pub struct ChannelCore {
    shared: Arc<ChannelShared>,
    state: ChannelState,
    queue: VecDeque<QueuedPublish>,
    attach_waiters: Vec<Reply<()>>,
    detach_waiters: Vec<Reply<()>>,
    attach_timer: Option<TimerHandle>,
    detach_timer: Option<TimerHandle>,
    releasing: bool,
}

fn reply(waiter: Option<Reply<()>>, result: Result<()>) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(result);
    }
}

fn fail_callback(callback: Option<AckCallback>, error: ErrorInfo) {
    if let Some(callback) = callback {
        callback(Err(error));
    }
}

fn default_reason(state: ChannelState) -> ErrorInfo {
    let message = match state {
        ChannelState::Failed => "Channel failed",
        ChannelState::Suspended => "Channel suspended",
        _ => "Channel detached",
    };
    ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, 400, message)
}

impl ChannelCore {
    pub fn new(shared: Arc<ChannelShared>) -> Self {
        Self {
            shared,
            state: ChannelState::Initialized,
            queue: VecDeque::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            attach_timer: None,
            detach_timer: None,
            releasing: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn is_bound_to(&self, shared: &Arc<ChannelShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Released channels leave the registry once they are detached or failed
    pub fn mark_releasing(&mut self) {
        self.releasing = true;
    }

    pub fn is_removable(&self) -> bool {
        self.releasing
            && matches!(
                self.state,
                ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
            )
    }

    pub fn attach<L: ChannelLink>(&mut self, link: &mut L, waiter: Option<Reply<()>>) {
        self.releasing = false;
        match self.state {
            ChannelState::Attached => return reply(waiter, Ok(())),
            ChannelState::Attaching => {
                self.attach_waiters.extend(waiter);
                return;
            }
            _ => {}
        }

        let connection = link.connection_state();
        if connection.rejects_channel_operations() {
            let error = ErrorInfo::invalid_channel_state(format!(
                "Cannot attach channel {} while connection is {}",
                self.name(),
                connection
            ));
            return reply(waiter, Err(error.into()));
        }

        self.attach_waiters.extend(waiter);
        self.set_channel_state(link, ChannelState::Attaching, None, None);
        match connection {
            ConnectionState::Connected => self.send_attach(link),
            // Nothing will start the connection on our behalf
            ConnectionState::Initialized => self.arm_attach_timer(link),
            _ => {}
        }
    }

    pub fn detach<L: ChannelLink>(&mut self, link: &mut L, waiter: Option<Reply<()>>) {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => reply(waiter, Ok(())),
            ChannelState::Detaching => self.detach_waiters.extend(waiter),
            ChannelState::Failed => reply(
                waiter,
                Err(RealtimeError::InvalidState(format!(
                    "Cannot detach channel {} in failed state",
                    self.name()
                ))),
            ),
            ChannelState::Suspended => {
                self.detach_waiters.extend(waiter);
                self.set_channel_state(link, ChannelState::Detached, None, None);
            }
            ChannelState::Attaching | ChannelState::Attached => {
                self.detach_waiters.extend(waiter);
                let connection = link.connection_state();
                if connection.rejects_channel_operations()
                    || connection == ConnectionState::Initialized
                {
                    self.set_channel_state(link, ChannelState::Detached, None, None);
                    return;
                }
                self.set_channel_state(link, ChannelState::Detaching, None, None);
                if connection == ConnectionState::Connected {
                    self.send_detach(link);
                }
            }
        }
    }

    /// Send now if attached, otherwise queue until the channel attaches
    pub fn publish<L: ChannelLink>(
        &mut self,
        link: &mut L,
        messages: Vec<Message>,
        callback: Option<AckCallback>,
    ) {
        let connection = link.connection_state();
        if connection.rejects_channel_operations() {
            let error = ErrorInfo::invalid_channel_state(format!(
                "Cannot publish while connection is {}",
                connection
            ));
            return fail_callback(callback, error);
        }

        match self.state {
            ChannelState::Attached => {
                link.send(ProtocolMessage::messages(self.name(), messages), callback);
            }
            ChannelState::Attaching => {
                self.queue.push_back(QueuedPublish { messages, callback });
            }
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Suspended => {
                self.queue.push_back(QueuedPublish { messages, callback });
                self.attach(link, None);
            }
            ChannelState::Detaching | ChannelState::Failed => {
                let error = ErrorInfo::invalid_channel_state(format!(
                    "Cannot publish on channel {} while {}",
                    self.name(),
                    self.state
                ));
                fail_callback(callback, error);
            }
        }
    }

    pub fn on_protocol_message<L: ChannelLink>(&mut self, link: &mut L, message: &ProtocolMessage) {
        match message.action {
            Action::Attached => self.on_attached(link, message),
            Action::Detached => self.on_detached(link, message),
            Action::Error => {
                let error = message
                    .error
                    .clone()
                    .unwrap_or_else(|| default_reason(ChannelState::Failed));
                warn!("Channel {} error: {}", self.name(), error);
                self.set_channel_state(link, ChannelState::Failed, Some(error), Some(message));
            }
            Action::Message => {
                if self.state == ChannelState::Attached {
                    self.deliver_messages(message);
                } else {
                    debug!("Dropping message for channel {} in state {}", self.name(), self.state);
                }
            }
            Action::Presence => self.deliver_presence(message),
            Action::Sync => {
                self.deliver_presence(message);
                let complete = message
                    .channel_serial
                    .as_deref()
                    .and_then(|serial| serial.split_once(':'))
                    .map_or(true, |(_, cursor)| cursor.is_empty());
                self.shared.presence_sync.store(!complete, Ordering::Release);
            }
            other => debug!("Channel {} ignoring {}", self.name(), other),
        }
    }

    fn on_attached<L: ChannelLink>(&mut self, link: &mut L, message: &ProtocolMessage) {
        match self.state {
            ChannelState::Attaching => {
                self.set_channel_state(link, ChannelState::Attached, message.error.clone(), Some(message));
            }
            ChannelState::Attached => {
                self.shared
                    .presence_sync
                    .store(message.has_flag(flags::HAS_PRESENCE), Ordering::Release);
                if let Some(error) = &message.error {
                    *self.shared.error_reason.lock() = Some(error.clone());
                    self.shared.state_changes.emit(ChannelStateChange {
                        channel: self.name().to_string(),
                        previous: ChannelState::Attached,
                        current: ChannelState::Attached,
                        reason: Some(error.clone()),
                        resumed: message.has_flag(flags::RESUMED),
                    });
                }
            }
            state => debug!("Ignoring Attached for channel {} in state {}", self.name(), state),
        }
    }

    fn on_detached<L: ChannelLink>(&mut self, link: &mut L, message: &ProtocolMessage) {
        match self.state {
            ChannelState::Detaching => {
                self.set_channel_state(link, ChannelState::Detached, message.error.clone(), Some(message));
            }
            ChannelState::Attaching => {
                let error = message
                    .error
                    .clone()
                    .unwrap_or_else(|| default_reason(ChannelState::Failed));
                self.set_channel_state(link, ChannelState::Failed, Some(error), Some(message));
            }
            ChannelState::Attached => {
                warn!("Channel {} detached by server, re-attaching", self.name());
                self.set_channel_state(link, ChannelState::Attaching, message.error.clone(), Some(message));
                if link.connection_state() == ConnectionState::Connected {
                    self.send_attach(link);
                }
            }
            state => debug!("Ignoring Detached for channel {} in state {}", self.name(), state),
        }
    }

    /// Follow a connection transition
    pub fn on_connection_state_changed<L: ChannelLink>(
        &mut self,
        link: &mut L,
        connection: ConnectionState,
        reason: Option<&ErrorInfo>,
        resumed: bool,
    ) {
        match connection {
            ConnectionState::Connected => match self.state {
                ChannelState::Attaching => self.send_attach(link),
                ChannelState::Attached if !resumed => {
                    self.set_channel_state(link, ChannelState::Attaching, None, None);
                    self.send_attach(link);
                }
                ChannelState::Detaching => self.send_detach(link),
                _ => {}
            },
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                // Re-armed when the request is sent again on the next connection
                self.attach_timer = None;
                self.detach_timer = None;
            }
            ConnectionState::Suspended | ConnectionState::Closed => {
                if self.state.is_active() || self.state == ChannelState::Detaching {
                    self.set_channel_state(link, ChannelState::Detached, reason.cloned(), None);
                }
            }
            ConnectionState::Failed => match self.state {
                ChannelState::Attaching | ChannelState::Attached => {
                    let error = reason
                        .cloned()
                        .unwrap_or_else(|| default_reason(ChannelState::Failed));
                    self.set_channel_state(link, ChannelState::Failed, Some(error), None);
                }
                ChannelState::Detaching => {
                    self.set_channel_state(link, ChannelState::Detached, reason.cloned(), None);
                }
                _ => {}
            },
            _ => {}
        }
    }

    pub fn on_timer<L: ChannelLink>(&mut self, link: &mut L, timer: ChannelTimer, id: u64) {
        let (slot, waiting_state, operation) = match timer {
            ChannelTimer::Attach => (&mut self.attach_timer, ChannelState::Attaching, "attach"),
            ChannelTimer::Detach => (&mut self.detach_timer, ChannelState::Detaching, "detach"),
        };
        if !take_if_current(slot, id) || self.state != waiting_state {
            debug!("Stale {} timer for channel {}", operation, self.name());
            return;
        }
        let error = ErrorInfo::timeout(format!(
            "Channel {} {} timed out after {:?}",
            self.name(),
            operation,
            link.request_timeout()
        ));
        warn!("{}", error.message);
        self.set_channel_state(link, ChannelState::Failed, Some(error), None);
    }

    /// Resolve everything outstanding when the engine stops
    pub fn abandon(&mut self, error: &ErrorInfo) {
        self.attach_timer = None;
        self.detach_timer = None;
        for queued in self.queue.drain(..) {
            fail_callback(queued.callback, error.clone());
        }
        for waiter in self.attach_waiters.drain(..).chain(self.detach_waiters.drain(..)) {
            let _ = waiter.send(Err(error.clone().into()));
        }
    }

    fn send_attach<L: ChannelLink>(&mut self, link: &mut L) {
        debug!("Sending attach for channel {}", self.name());
        link.send(ProtocolMessage::attach(self.name()), None);
        self.arm_attach_timer(link);
    }

    fn arm_attach_timer<L: ChannelLink>(&mut self, link: &mut L) {
        let timeout = link.request_timeout();
        self.attach_timer = Some(link.schedule(&self.shared.name, ChannelTimer::Attach, timeout));
    }

    fn send_detach<L: ChannelLink>(&mut self, link: &mut L) {
        debug!("Sending detach for channel {}", self.name());
        link.send(ProtocolMessage::detach(self.name()), None);
        let timeout = link.request_timeout();
        self.detach_timer = Some(link.schedule(&self.shared.name, ChannelTimer::Detach, timeout));
    }

    fn set_channel_state<L: ChannelLink>(
        &mut self,
        link: &mut L,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        message: Option<&ProtocolMessage>,
    ) {
        let previous = self.state;
        if state != ChannelState::Attaching {
            self.attach_timer = None;
        }
        if state != ChannelState::Detaching {
            self.detach_timer = None;
        }

        self.state = state;
        self.shared.state.set(state);
        if reason.is_some() || state == ChannelState::Attached {
            *self.shared.error_reason.lock() = reason.clone();
        }
        info!("Channel {}: {} -> {}", self.name(), previous, state);

        self.shared.state_changes.emit(ChannelStateChange {
            channel: self.name().to_string(),
            previous,
            current: state,
            reason: reason.clone(),
            resumed: message.map_or(false, |m| m.has_flag(flags::RESUMED)),
        });

        match state {
            ChannelState::Attaching => {
                let error = ErrorInfo::invalid_channel_state("Attach requested while detaching");
                for waiter in self.detach_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone().into()));
                }
            }
            ChannelState::Detaching => {
                let error = ErrorInfo::invalid_channel_state("Detach requested while attaching");
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone().into()));
                }
            }
            ChannelState::Attached => {
                let has_presence = message.map_or(false, |m| m.has_flag(flags::HAS_PRESENCE));
                self.shared.presence_sync.store(has_presence, Ordering::Release);
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                while let Some(queued) = self.queue.pop_front() {
                    link.send(
                        ProtocolMessage::messages(self.name(), queued.messages),
                        queued.callback,
                    );
                }
            }
            ChannelState::Detached | ChannelState::Suspended | ChannelState::Failed => {
                self.shared.presence_sync.store(false, Ordering::Release);
                let error = reason.unwrap_or_else(|| default_reason(state));
                for queued in self.queue.drain(..) {
                    fail_callback(queued.callback, error.clone());
                }
                for waiter in self.attach_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone().into()));
                }
                for waiter in self.detach_waiters.drain(..) {
                    let result = if state == ChannelState::Detached {
                        Ok(())
                    } else {
                        Err(error.clone().into())
                    };
                    let _ = waiter.send(result);
                }
            }
            ChannelState::Initialized => {}
        }
    }

    fn deliver_messages(&self, envelope: &ProtocolMessage) {
        let Some(messages) = &envelope.messages else {
            return;
        };
        for (index, message) in messages.iter().enumerate() {
            let mut message = message.clone();
            if message.id.is_none() {
                message.id = envelope.id.as_ref().map(|id| format!("{}:{}", id, index));
            }
            if message.connection_id.is_none() {
                message.connection_id = envelope.connection_id.clone();
            }
            if message.timestamp.is_none() {
                message.timestamp = envelope.timestamp;
            }
            self.shared.messages.emit(message);
        }
    }

    fn deliver_presence(&self, envelope: &ProtocolMessage) {
        let Some(presence) = &envelope.presence else {
            return;
        };
        for (index, member) in presence.iter().enumerate() {
            let mut member = member.clone();
            if member.id.is_none() {
                member.id = envelope.id.as_ref().map(|id| format!("{}:{}", id, index));
            }
            if member.connection_id.is_none() {
                member.connection_id = envelope.connection_id.clone();
            }
            if member.timestamp.is_none() {
                member.timestamp = envelope.timestamp;
            }
            self.shared.presence.emit(member);
        }
    }
}
