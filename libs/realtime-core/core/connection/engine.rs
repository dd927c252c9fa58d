//! Connection engine: the single owner of connection and channel state
//!
//! User calls, transport events, timer expiries and auth results all arrive as
//! `Command`s on one inbox and are applied one at a time by `Engine::run`.
//! Nothing else mutates connection or channel state, so cross-field invariants
//! (serial reset together with the state change, channel forcing together with
//! the connection transition) hold without fine-grained locking.

use super::command::{Command, Reply, TimerKind};
use super::{ClientEvent, ConnectionIdentity, ConnectionShared, Metrics};
use crate::core::ack::{AckCallback, AckProcessor};
use crate::core::auth_coordinator::{AuthCoordinator, CredentialResult};
use crate::core::channel::state_machine::{ChannelCore, ChannelLink, ChannelTimer};
use crate::core::channel::{Channel, ChannelShared};
use crate::core::config::ClientOptions;
use crate::core::connection_state::{ConnectionState, ConnectionStateChange};
use crate::core::params::{ResumeToken, TransportParams};
use crate::core::policy::ReconnectionPolicy;
use crate::core::timer::{self, take_if_current, TimerHandle};
use crate::error::{RealtimeError, Result};
use crate::protocol::{Action, ErrorInfo, ProtocolMessage};
use crate::traits::{
    AuthCredential, ConnectivityProbe, Transport, TransportEvent, TransportFactory,
    TransportListener, TransportState,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Registry of channel handles shared with `Channels`
pub(crate) type ChannelRegistry = Arc<Mutex<HashMap<String, Channel>>>;

struct ActiveTransport {
    id: u64,
    inner: Box<dyn Transport>,
}

#[derive(Default)]
struct ConnectionTimers {
    attempt: Option<TimerHandle>,
    retry: Option<TimerHandle>,
    close: Option<TimerHandle>,
    idle: Option<TimerHandle>,
}

impl ConnectionTimers {
    fn clear(&mut self) {
        self.attempt = None;
        self.retry = None;
        self.close = None;
        self.idle = None;
    }
}

struct PendingPing {
    started: Instant,
    reply: Reply<Duration>,
    timer: TimerHandle,
}

/// Collaborators the engine is built from
pub(crate) struct EngineParts {
    pub options: Arc<ClientOptions>,
    pub factory: Arc<dyn TransportFactory>,
    pub auth: AuthCoordinator,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub policy: ReconnectionPolicy,
}

/// Connection-level state; the `ChannelLink` seen by every channel
pub(crate) struct ConnectionCore {
    options: Arc<ClientOptions>,
    inbox: UnboundedSender<Command>,
    shared: Arc<ConnectionShared>,
    state: ConnectionState,

    factory: Arc<dyn TransportFactory>,
    transport: Option<ActiveTransport>,
    next_transport_id: u64,
    current_host: String,

    auth: AuthCoordinator,
    probe: Arc<dyn ConnectivityProbe>,
    policy: ReconnectionPolicy,
    acks: AckProcessor,
    queued: VecDeque<(ProtocolMessage, Option<AckCallback>)>,
    timers: ConnectionTimers,
    next_timer_id: u64,
    pings: HashMap<String, PendingPing>,
    next_ping: u64,
    authorize_waiters: Vec<Reply<()>>,
    authorize_timer: Option<TimerHandle>,

    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    client_id: Option<String>,
    recover: Option<String>,
    max_idle_interval: Option<Duration>,

    attempt: u64,
    use_fallback: bool,
    immediate_retry: bool,
    awaiting_auth: bool,
    renewed_this_sequence: bool,
    resumed: bool,
}

impl ConnectionCore {
    fn schedule_timer(&mut self, kind: TimerKind, delay: Duration) -> TimerHandle {
        self.next_timer_id += 1;
        timer::schedule(&self.inbox, self.next_timer_id, delay, move |id| {
            Command::TimerFired { timer: kind, id }
        })
    }

    /// Run `work` off the engine task and feed its result back as a command
    fn spawn_reporting<F>(&self, work: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let _ = inbox.send(work.await);
        });
    }

    fn request_timeout(&self) -> Duration {
        self.options.realtime_request_timeout()
    }

    fn error_for_state(&self) -> ErrorInfo {
        match self.state {
            ConnectionState::Suspended => ErrorInfo::suspended(),
            ConnectionState::Failed => self
                .shared
                .error_reason
                .lock()
                .clone()
                .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed")),
            ConnectionState::Closing | ConnectionState::Closed => ErrorInfo::closed(),
            state => ErrorInfo::disconnected(format!("Connection is {}", state)),
        }
    }

    /// Send now when connected, queue while a connection is expected
    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>) {
        match self.state {
            ConnectionState::Connected => self.send_now(message, callback),
            state if state.queues_messages() && self.options.queue_messages => {
                debug!("Queueing {} while {}", message.action, state);
                self.queued.push_back((message, callback));
            }
            _ => {
                if let Some(callback) = callback {
                    callback(Err(self.error_for_state()));
                }
            }
        }
    }

    fn send_now(&mut self, mut message: ProtocolMessage, callback: Option<AckCallback>) {
        let callback = self.acks.queue_if_necessary(&mut message, callback);
        debug!("Sending {} (msgSerial {:?})", message.action, message.msg_serial);
        let result = match &self.transport {
            Some(active) => active.inner.send(message),
            None => Err(RealtimeError::ConnectionClosed("no active transport".into())),
        };
        match result {
            Ok(()) => {
                self.shared.metrics.increment_sent();
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
            }
            Err(e) => {
                warn!("Send failed: {}", e);
                let info = e.to_error_info();
                self.shared.events.emit(ClientEvent::Error(info.clone()));
                if let Some(callback) = callback {
                    callback(Err(info));
                }
            }
        }
    }

    fn teardown_transport(&mut self) {
        if let Some(active) = self.transport.take() {
            debug!("Closing transport {}", active.id);
            active.inner.close();
        }
    }

    fn transport_connected(&self) -> bool {
        self.transport
            .as_ref()
            .map_or(false, |active| active.inner.state() == TransportState::Connected)
    }

    fn publish_identity(&self) {
        *self.shared.identity.lock() = ConnectionIdentity {
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            serial: self.connection_serial,
            client_id: self.client_id.clone(),
        };
    }

    fn forget_connection(&mut self) {
        self.connection_key = None;
        self.connection_serial = None;
        self.publish_identity();
    }

    fn start_attempt(&mut self) {
        self.teardown_transport();
        self.attempt += 1;
        self.policy.record_attempt(Instant::now());

        let primary = self.policy.primary_host().to_string();
        self.current_host = if self.use_fallback {
            self.policy.next_fallback_host().unwrap_or(primary)
        } else {
            primary
        };
        info!("Connection attempt {} to {}", self.attempt, self.current_host);

        let timeout = self.request_timeout();
        self.timers.attempt = Some(self.schedule_timer(TimerKind::ConnectAttempt, timeout));

        let attempt = self.attempt;
        let credential = self.auth.credential();
        self.spawn_reporting(async move {
            Command::CredentialReady {
                attempt,
                result: credential.await,
            }
        });
    }

    fn open_transport(&mut self, credential: AuthCredential) -> Result<()> {
        let resume = self.connection_key.as_ref().map(|key| ResumeToken {
            connection_key: key.clone(),
            connection_serial: self.connection_serial,
        });
        let params = TransportParams {
            host: self.current_host.clone(),
            port: self.options.effective_port(),
            tls: self.options.tls,
            format: self.options.format,
            credential,
            client_id: self.options.client_id.clone(),
            echo: self.options.echo_messages,
            recover: if resume.is_none() { self.recover.clone() } else { None },
            resume,
        };

        self.next_transport_id += 1;
        let transport_id = self.next_transport_id;
        let inbox = self.inbox.downgrade();
        let listener = TransportListener::new(transport_id, move |transport_id, event| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Command::Transport {
                    transport_id,
                    event,
                });
            }
        });

        let transport = self.factory.create(params, listener)?;
        transport.connect();
        self.transport = Some(ActiveTransport {
            id: transport_id,
            inner: transport,
        });
        Ok(())
    }

    fn check_connectivity(&self) {
        let probe = Arc::clone(&self.probe);
        let attempt = self.attempt;
        self.spawn_reporting(async move {
            Command::ConnectivityChecked {
                attempt,
                reachable: probe.is_reachable().await,
            }
        });
    }

    fn arm_idle_timer(&mut self) {
        if let Some(idle) = self.max_idle_interval {
            let timeout = idle + self.request_timeout();
            self.timers.idle = Some(self.schedule_timer(TimerKind::Idle, timeout));
        }
    }

    fn ping(&mut self, reply: Reply<Duration>) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(RealtimeError::InvalidState(format!(
                "Cannot ping while {}",
                self.state
            ))));
            return;
        }
        self.next_ping += 1;
        let id = format!("ping-{}", self.next_ping);
        self.send_now(ProtocolMessage::heartbeat(id.clone()), None);
        let timeout = self.request_timeout();
        let timer = self.schedule_timer(TimerKind::Ping(id.clone()), timeout);
        self.pings.insert(
            id,
            PendingPing {
                started: Instant::now(),
                reply,
                timer,
            },
        );
    }

    fn on_heartbeat(&mut self, message: &ProtocolMessage) {
        let Some(id) = &message.id else {
            return;
        };
        if let Some(ping) = self.pings.remove(id) {
            let _ = ping.reply.send(Ok(ping.started.elapsed()));
        }
    }

    fn on_ping_timeout(&mut self, ping_id: &str, timer_id: u64) {
        let current = self
            .pings
            .get(ping_id)
            .map_or(false, |ping| ping.timer.id() == timer_id);
        if !current {
            return;
        }
        if let Some(ping) = self.pings.remove(ping_id) {
            let _ = ping.reply.send(Err(RealtimeError::Timeout(format!(
                "no heartbeat response within {:?}",
                self.request_timeout()
            ))));
        }
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(error.clone().into()));
        }
    }

    fn fail_queued(&mut self, error: &ErrorInfo) {
        for (_, callback) in self.queued.drain(..) {
            if let Some(callback) = callback {
                callback(Err(error.clone()));
            }
        }
    }

    fn resolve_authorize_waiters(&mut self, result: std::result::Result<(), ErrorInfo>) {
        self.authorize_timer = None;
        for waiter in self.authorize_waiters.drain(..) {
            let _ = waiter.send(result.clone().map_err(RealtimeError::from));
        }
    }

    /// Entry actions; returns the retry delay announced with the change and
    /// an immediate follow-up transition, if any
    fn enter_state(
        &mut self,
        state: ConnectionState,
        previous: ConnectionState,
        reason: Option<&ErrorInfo>,
    ) -> (Option<Duration>, Option<ConnectionState>) {
        let replay = self.acks.on_state_changed(state, reason);

        match state {
            ConnectionState::Initialized => (None, None),
            ConnectionState::Connecting => {
                if matches!(previous, ConnectionState::Disconnected | ConnectionState::Suspended) {
                    self.shared.metrics.increment_reconnects();
                }
                self.start_attempt();
                (None, None)
            }
            ConnectionState::Connected => {
                self.policy.reset();
                self.use_fallback = false;
                self.immediate_retry = false;
                self.renewed_this_sequence = false;
                if !replay.is_empty() {
                    info!("Resending {} unacknowledged messages", replay.len());
                }
                for pending in replay {
                    self.send_now(pending.message, pending.callback);
                }
                while let Some((message, callback)) = self.queued.pop_front() {
                    self.send_now(message, callback);
                }
                self.arm_idle_timer();
                self.resolve_authorize_waiters(Ok(()));
                (None, None)
            }
            ConnectionState::Disconnected => {
                self.teardown_transport();
                self.fail_pings(&reason.cloned().unwrap_or_else(|| self.error_for_state()));
                if self.awaiting_auth {
                    return (None, None);
                }
                let delay = if self.immediate_retry {
                    Duration::ZERO
                } else {
                    self.policy.disconnected_retry_delay()
                };
                self.immediate_retry = false;
                self.timers.retry = Some(self.schedule_timer(TimerKind::Retry, delay));
                (Some(delay), None)
            }
            ConnectionState::Suspended => {
                self.teardown_transport();
                let error = ErrorInfo::suspended();
                self.fail_pings(&error);
                // Channels are forced to Detached, so nothing they sent survives
                self.acks.fail_all(&error);
                self.fail_queued(&error);
                self.forget_connection();
                let delay = self.policy.suspended_retry_delay();
                self.timers.retry = Some(self.schedule_timer(TimerKind::Retry, delay));
                (Some(delay), None)
            }
            ConnectionState::Closing => {
                self.fail_pings(&ErrorInfo::closed());
                if self.transport_connected() {
                    self.send_now(ProtocolMessage::close(), None);
                    let timeout = self.request_timeout();
                    self.timers.close = Some(self.schedule_timer(TimerKind::ForceClose, timeout));
                    (None, None)
                } else {
                    (None, Some(ConnectionState::Closed))
                }
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.teardown_transport();
                let error = reason.cloned().unwrap_or_else(|| {
                    if state == ConnectionState::Closed {
                        ErrorInfo::closed()
                    } else {
                        ErrorInfo::connection_failed("Connection failed")
                    }
                });
                self.fail_pings(&error);
                self.fail_queued(&error);
                self.resolve_authorize_waiters(Err(error));
                self.awaiting_auth = false;
                self.forget_connection();
                (None, None)
            }
        }
    }
}

impl ChannelLink for ConnectionCore {
    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn send(&mut self, message: ProtocolMessage, callback: Option<AckCallback>) {
        ConnectionCore::send(self, message, callback);
    }

    fn schedule(&mut self, channel: &str, timer: ChannelTimer, delay: Duration) -> TimerHandle {
        self.schedule_timer(TimerKind::Channel(channel.to_string(), timer), delay)
    }

    fn request_timeout(&self) -> Duration {
        ConnectionCore::request_timeout(self)
    }
}

pub(crate) struct Engine {
    core: ConnectionCore,
    channels: HashMap<String, ChannelCore>,
    registry: ChannelRegistry,
}

impl Engine {
    pub(crate) fn new(
        parts: EngineParts,
        shared: Arc<ConnectionShared>,
        registry: ChannelRegistry,
        inbox: UnboundedSender<Command>,
    ) -> Self {
        let recover = parts.options.recover.clone();
        let current_host = parts.policy.primary_host().to_string();
        Self {
            core: ConnectionCore {
                options: parts.options,
                inbox,
                shared,
                state: ConnectionState::Initialized,
                factory: parts.factory,
                transport: None,
                next_transport_id: 0,
                current_host,
                auth: parts.auth,
                probe: parts.probe,
                policy: parts.policy,
                acks: AckProcessor::new(),
                queued: VecDeque::new(),
                timers: ConnectionTimers::default(),
                next_timer_id: 0,
                pings: HashMap::new(),
                next_ping: 0,
                authorize_waiters: Vec::new(),
                authorize_timer: None,
                connection_id: None,
                connection_key: None,
                connection_serial: None,
                client_id: None,
                recover,
                max_idle_interval: None,
                attempt: 0,
                use_fallback: false,
                immediate_retry: false,
                awaiting_auth: false,
                renewed_this_sequence: false,
                resumed: false,
            },
            channels: HashMap::new(),
            registry,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: UnboundedReceiver<Command>) {
        info!("Connection engine started");
        while let Some(command) = inbox.recv().await {
            if let Command::Shutdown = command {
                self.shutdown();
                break;
            }
            self.handle_command(command);
            self.reap_released_channels();
        }
        info!("Connection engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::Ping(reply) => self.core.ping(reply),
            Command::Authorize(reply) => {
                self.core.authorize_waiters.push(reply);
                self.start_renewal();
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.metrics());
            }
            Command::AddChannel(shared) => {
                self.channels
                    .entry(shared.name.clone())
                    .or_insert_with(|| ChannelCore::new(shared));
            }
            Command::Attach { channel, reply } => {
                match bound_channel(&mut self.channels, &channel) {
                    Some(core) => core.attach(&mut self.core, reply),
                    None => unknown_channel(&channel.name, reply),
                }
            }
            Command::Detach { channel, reply } => {
                match bound_channel(&mut self.channels, &channel) {
                    Some(core) => core.detach(&mut self.core, reply),
                    None => unknown_channel(&channel.name, reply),
                }
            }
            Command::Publish {
                channel,
                messages,
                callback,
            } => match bound_channel(&mut self.channels, &channel) {
                Some(core) => core.publish(&mut self.core, messages, callback),
                None => {
                    if let Some(callback) = callback {
                        callback(Err(ErrorInfo::invalid_channel_state(format!(
                            "Channel {} was released",
                            channel.name
                        ))));
                    }
                }
            },
            Command::Release { channel } => self.release(channel),
            Command::Transport {
                transport_id,
                event,
            } => self.on_transport_event(transport_id, event),
            Command::TimerFired { timer, id } => self.on_timer(timer, id),
            Command::CredentialReady { attempt, result } => self.on_credential(attempt, result),
            Command::AuthRenewed { result } => self.on_auth_renewed(result),
            Command::ConnectivityChecked { attempt, reachable } => {
                self.on_connectivity_checked(attempt, reachable)
            }
            Command::Shutdown => {}
        }
    }

    /// Apply a transition plus any follow-up it triggers
    fn set_state(&mut self, state: ConnectionState, reason: Option<ErrorInfo>) {
        let mut next = Some((state, reason));
        while let Some((state, reason)) = next.take() {
            next = self
                .apply_transition(state, reason)
                .map(|follow_up| (follow_up, None));
        }
    }

    fn apply_transition(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
    ) -> Option<ConnectionState> {
        let previous = self.core.state;
        self.core.timers.clear();
        self.core.state = state;
        self.core.shared.state.set(state);
        if reason.is_some() || state == ConnectionState::Connected {
            *self.core.shared.error_reason.lock() = reason.clone();
        }

        let (retry_in, follow_up) = self.core.enter_state(state, previous, reason.as_ref());

        match &reason {
            Some(reason) => info!("Connection: {} -> {} ({})", previous, state, reason),
            None => info!("Connection: {} -> {}", previous, state),
        }
        let change = ConnectionStateChange {
            previous,
            current: state,
            reason: reason.clone(),
            retry_in,
        };
        self.core.shared.state_changes.emit(change.clone());
        self.core.shared.events.emit(ClientEvent::StateChanged(change));

        let resumed = state == ConnectionState::Connected && self.core.resumed;
        for channel in self.channels.values_mut() {
            channel.on_connection_state_changed(&mut self.core, state, reason.as_ref(), resumed);
        }
        follow_up
    }

    fn connect(&mut self) {
        match self.core.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Connect ignored while {}", self.core.state)
            }
            ConnectionState::Closing => debug!("Connect ignored while closing"),
            state => {
                if matches!(
                    state,
                    ConnectionState::Initialized | ConnectionState::Closed | ConnectionState::Failed
                ) {
                    self.core.policy.reset();
                    self.core.use_fallback = false;
                }
                self.set_state(ConnectionState::Connecting, None);
            }
        }
    }

    fn close(&mut self) {
        match self.core.state {
            ConnectionState::Closing | ConnectionState::Closed => {
                debug!("Close ignored while {}", self.core.state)
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.set_state(ConnectionState::Closing, None)
            }
            _ => self.set_state(ConnectionState::Closed, None),
        }
    }

    fn on_credential(&mut self, attempt: u64, result: CredentialResult) {
        if attempt != self.core.attempt || self.core.state != ConnectionState::Connecting {
            debug!("Discarding credential for superseded attempt {}", attempt);
            return;
        }
        match result {
            Ok(credential) => {
                if let Err(e) = self.core.open_transport(credential) {
                    error!("Failed to create transport: {}", e);
                    self.set_state(ConnectionState::Failed, Some(e.to_error_info()));
                }
            }
            Err(error) => {
                warn!("Credential lookup failed: {}", error);
                if self.core.auth.can_renew() {
                    self.on_retryable_failure(error);
                } else {
                    self.set_state(ConnectionState::Failed, Some(error));
                }
            }
        }
    }

    fn on_transport_event(&mut self, transport_id: u64, event: TransportEvent) {
        let current = self.core.transport.as_ref().map(|active| active.id);
        if current != Some(transport_id) {
            debug!("Ignoring event from stale transport {}", transport_id);
            return;
        }
        match event {
            TransportEvent::Connected => {
                debug!("Transport {} open, awaiting CONNECTED", transport_id)
            }
            TransportEvent::MessageReceived(message) => self.on_protocol_message(message),
            TransportEvent::Disconnected(reason) => {
                let error = reason.unwrap_or_else(|| ErrorInfo::disconnected("Transport closed"));
                self.on_transport_lost(error);
            }
            TransportEvent::Error(error) => {
                self.core.shared.events.emit(ClientEvent::Error(error.clone()));
                self.on_transport_lost(error);
            }
        }
    }

    fn on_transport_lost(&mut self, error: ErrorInfo) {
        self.core.teardown_transport();
        match self.core.state {
            ConnectionState::Connecting => self.on_connect_failure(error),
            ConnectionState::Connected => {
                info!("Connection dropped: {}", error);
                self.core.immediate_retry = true;
                self.set_state(ConnectionState::Disconnected, Some(error));
            }
            ConnectionState::Closing => self.set_state(ConnectionState::Closed, None),
            state => debug!("Transport lost while {}", state),
        }
    }

    fn on_protocol_message(&mut self, message: ProtocolMessage) {
        self.core.shared.metrics.increment_received();
        if self.core.state == ConnectionState::Connected {
            self.core.arm_idle_timer();
        }
        if message.action != Action::Connected {
            if let Some(serial) = message.connection_serial {
                self.core.connection_serial = Some(serial);
                self.core.publish_identity();
            }
        }
        debug!("Received {} {:?}", message.action, message.channel);

        match message.action {
            Action::Heartbeat => self.core.on_heartbeat(&message),
            Action::Ack | Action::Nack => {
                self.core.acks.on_message_received(&message);
            }
            Action::Connected => self.on_connected(message),
            Action::Disconnected => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::disconnected("Disconnected by server"));
                match self.core.state {
                    ConnectionState::Connecting => self.on_connect_failure(error),
                    ConnectionState::Connected if error.is_token_error() => self.on_token_error(error),
                    ConnectionState::Connected => {
                        self.core.immediate_retry = true;
                        self.set_state(ConnectionState::Disconnected, Some(error));
                    }
                    state => debug!("Disconnected ignored while {}", state),
                }
            }
            Action::Error if message.channel.is_some() => self.route_to_channel(&message),
            Action::Error => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::connection_failed("Error from server"));
                self.on_connection_error(error);
            }
            Action::Closed => match self.core.state {
                ConnectionState::Closed | ConnectionState::Failed => {}
                _ => self.set_state(ConnectionState::Closed, message.error),
            },
            Action::Auth => {
                info!("Server requested re-authentication");
                self.start_renewal();
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => self.route_to_channel(&message),
            other => debug!("Unexpected inbound {}", other),
        }
    }

    fn route_to_channel(&mut self, message: &ProtocolMessage) {
        let Some(name) = &message.channel else {
            warn!("{} without channel ignored", message.action);
            return;
        };
        match self.channels.get_mut(name) {
            Some(channel) => channel.on_protocol_message(&mut self.core, message),
            None => debug!("{} for unknown channel {}", message.action, name),
        }
    }

    fn on_connected(&mut self, message: ProtocolMessage) {
        let state = self.core.state;
        if !matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("Connected ignored while {}", state);
            return;
        }

        let resumed =
            self.core.connection_id.is_some() && self.core.connection_id == message.connection_id;
        if let Some(error) = &message.error {
            warn!("Connected with error: {}", error);
        }

        let details = message.connection_details.clone().unwrap_or_default();
        self.core.connection_id = message.connection_id.clone();
        self.core.connection_key = details.connection_key.or(message.connection_key.clone());
        if !resumed {
            self.core.connection_serial = None;
        }
        if let Some(serial) = message.connection_serial {
            self.core.connection_serial = Some(serial);
        }
        if let Some(client_id) = details.client_id {
            self.core.client_id = Some(client_id);
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.core.policy.set_connection_state_ttl(Duration::from_millis(ttl));
        }
        self.core.max_idle_interval = details
            .max_idle_interval
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        self.core.recover = None;
        self.core.publish_identity();

        if state == ConnectionState::Connected {
            info!("Connection details updated");
            if let Some(error) = message.error {
                *self.core.shared.error_reason.lock() = Some(error.clone());
                self.core.shared.events.emit(ClientEvent::Error(error));
            }
            self.core.resolve_authorize_waiters(Ok(()));
            return;
        }

        self.core.resumed = resumed;
        self.set_state(ConnectionState::Connected, message.error);
    }

    fn on_connection_error(&mut self, error: ErrorInfo) {
        if error.is_token_error() {
            return self.on_token_error(error);
        }
        match self.core.state {
            ConnectionState::Connecting if error.is_retryable() => self.on_connect_failure(error),
            ConnectionState::Closed | ConnectionState::Failed => {
                debug!("Error ignored while {}: {}", self.core.state, error)
            }
            _ => {
                error!("Connection error: {}", error);
                self.set_state(ConnectionState::Failed, Some(error));
            }
        }
    }

    fn on_connect_failure(&mut self, error: ErrorInfo) {
        if error.is_token_error() {
            return self.on_token_error(error);
        }
        self.on_retryable_failure(error);
    }

    fn on_retryable_failure(&mut self, error: ErrorInfo) {
        self.core.teardown_transport();
        if self.core.policy.should_suspend(Instant::now()) {
            warn!(
                "No connection for {:?}, suspending",
                self.core.policy.connection_state_ttl()
            );
            return self.set_state(ConnectionState::Suspended, Some(ErrorInfo::suspended()));
        }
        if self.core.policy.can_fallback(&error) {
            self.core.check_connectivity();
        }
        self.set_state(ConnectionState::Disconnected, Some(error));
    }

    fn on_connectivity_checked(&mut self, attempt: u64, reachable: bool) {
        if attempt != self.core.attempt || self.core.state != ConnectionState::Disconnected {
            return;
        }
        if reachable {
            info!("Internet reachable, retrying on a fallback host");
            self.core.use_fallback = true;
            self.set_state(ConnectionState::Connecting, None);
        } else {
            info!("Internet unreachable, waiting for the next retry");
        }
    }

    fn on_token_error(&mut self, error: ErrorInfo) {
        if !self.core.auth.can_renew() {
            warn!("Token rejected with no means to renew: {}", error);
            return self.set_state(ConnectionState::Failed, Some(error));
        }
        if self.core.renewed_this_sequence {
            warn!("Token rejected again after renewal: {}", error);
            return self.on_retryable_failure(error);
        }
        info!("Token rejected, renewing before reconnecting: {}", error);
        self.core.awaiting_auth = true;
        self.set_state(ConnectionState::Disconnected, Some(error));
        self.start_renewal();
    }

    fn start_renewal(&mut self) {
        if let Some(renewal) = self.core.auth.begin_renewal() {
            self.core.spawn_reporting(async move {
                Command::AuthRenewed {
                    result: renewal.await,
                }
            });
        }
    }

    fn on_auth_renewed(&mut self, result: CredentialResult) {
        self.core.auth.complete_renewal(&result);
        match result {
            Ok(credential) => {
                info!("Token renewed");
                self.core.renewed_this_sequence = true;
                self.core.shared.events.emit(ClientEvent::AuthUpdated);

                if self.core.awaiting_auth {
                    self.core.awaiting_auth = false;
                    if self.core.state == ConnectionState::Disconnected {
                        self.set_state(ConnectionState::Connecting, None);
                    }
                    return;
                }
                match (self.core.state, credential) {
                    (ConnectionState::Connected, AuthCredential::Token(token)) => {
                        debug!("Sending renewed token in-band");
                        self.core.send_now(ProtocolMessage::auth(token.token), None);
                        let timeout = self.core.request_timeout();
                        self.core.authorize_timer =
                            Some(self.core.schedule_timer(TimerKind::Authorize, timeout));
                    }
                    _ => self.core.resolve_authorize_waiters(Ok(())),
                }
            }
            Err(error) => {
                self.core.resolve_authorize_waiters(Err(error.clone()));
                if self.core.awaiting_auth {
                    self.core.awaiting_auth = false;
                    if self.core.state == ConnectionState::Disconnected {
                        self.set_state(ConnectionState::Disconnected, Some(error));
                    }
                }
            }
        }
    }

    fn on_timer(&mut self, timer: TimerKind, id: u64) {
        let now = Instant::now();
        match timer {
            TimerKind::ConnectAttempt => {
                if take_if_current(&mut self.core.timers.attempt, id)
                    && self.core.state == ConnectionState::Connecting
                {
                    warn!("Connection attempt {} timed out", self.core.attempt);
                    let error = ErrorInfo::timeout(format!(
                        "Connection attempt timed out after {:?}",
                        self.core.request_timeout()
                    ));
                    self.on_connect_failure(error);
                }
            }
            TimerKind::Retry => {
                if !take_if_current(&mut self.core.timers.retry, id) {
                    return;
                }
                match self.core.state {
                    ConnectionState::Disconnected if self.core.policy.should_suspend(now) => {
                        self.set_state(ConnectionState::Suspended, Some(ErrorInfo::suspended()))
                    }
                    ConnectionState::Disconnected | ConnectionState::Suspended => {
                        self.set_state(ConnectionState::Connecting, None)
                    }
                    _ => {}
                }
            }
            TimerKind::ForceClose => {
                if take_if_current(&mut self.core.timers.close, id)
                    && self.core.state == ConnectionState::Closing
                {
                    warn!("No CLOSED from server, forcing close");
                    self.set_state(ConnectionState::Closed, None);
                }
            }
            TimerKind::Idle => {
                if take_if_current(&mut self.core.timers.idle, id)
                    && self.core.state == ConnectionState::Connected
                {
                    let error = ErrorInfo::disconnected(format!(
                        "No activity seen from server in {:?}",
                        self.core.max_idle_interval.unwrap_or_default()
                    ));
                    warn!("{}", error.message);
                    self.core.immediate_retry = true;
                    self.set_state(ConnectionState::Disconnected, Some(error));
                }
            }
            TimerKind::Authorize => {
                if take_if_current(&mut self.core.authorize_timer, id) {
                    let error = ErrorInfo::timeout(format!(
                        "No confirmation of the renewed token within {:?}",
                        self.core.request_timeout()
                    ));
                    warn!("{}", error.message);
                    self.core.resolve_authorize_waiters(Err(error));
                }
            }
            TimerKind::Ping(ping_id) => self.core.on_ping_timeout(&ping_id, id),
            TimerKind::Channel(name, timer) => {
                if let Some(channel) = self.channels.get_mut(&name) {
                    channel.on_timer(&mut self.core, timer, id);
                }
            }
        }
    }

    fn release(&mut self, name: String) {
        match self.channels.get_mut(&name) {
            Some(channel) => {
                channel.mark_releasing();
                if !channel.is_removable() {
                    channel.detach(&mut self.core, None);
                }
            }
            None => {
                self.registry.lock().remove(&name);
            }
        }
    }

    fn reap_released_channels(&mut self) {
        let removable: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_removable())
            .map(|(name, _)| name.clone())
            .collect();
        for name in removable {
            self.channels.remove(&name);
            self.registry.lock().remove(&name);
            info!("Channel {} released", name);
        }
    }

    fn metrics(&self) -> Metrics {
        let metrics = &self.core.shared.metrics;
        Metrics {
            messages_sent: metrics.messages_sent(),
            messages_received: metrics.messages_received(),
            reconnect_count: metrics.reconnect_count(),
            pending_acks: self.core.acks.pending_count(),
            queued_messages: self.core.queued.len()
                + self.channels.values().map(ChannelCore::queued_count).sum::<usize>(),
            connection_state: self.core.state,
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down connection engine");
        if !self.core.state.is_terminal() {
            if self.core.transport_connected() {
                self.core.send_now(ProtocolMessage::close(), None);
            }
            self.set_state(ConnectionState::Closed, None);
        }
        let error = ErrorInfo::closed();
        for channel in self.channels.values_mut() {
            channel.abandon(&error);
        }
        self.core.resolve_authorize_waiters(Err(error));
    }
}

/// The state machine behind `shared`; none once that channel was released,
/// even if the name has been reused since
fn bound_channel<'a>(
    channels: &'a mut HashMap<String, ChannelCore>,
    shared: &Arc<ChannelShared>,
) -> Option<&'a mut ChannelCore> {
    channels
        .get_mut(&shared.name)
        .filter(|core| core.is_bound_to(shared))
}

fn unknown_channel(name: &str, reply: Option<Reply<()>>) {
    if let Some(reply) = reply {
        let _ = reply.send(Err(RealtimeError::InvalidState(format!(
            "Channel {} was released",
            name
        ))));
    }
}
