//! Common test utilities for realtime-core integration tests
//!
//! `FakeNetwork` is a scripted in-memory transport: tests choose whether it
//! accepts connections and answers protocol requests, inspect what the engine
//! sent, and inject inbound messages or transport failures.
//! `MockRealtimeServer` is a real WebSocket server for the bundled transport.

#![allow(dead_code)]

use parking_lot::Mutex;
use realtime_core::core::params::TransportParams;
use realtime_core::protocol::{encode, Action, ConnectionDetails, ErrorInfo, ProtocolMessage, WsMessage};
use realtime_core::{
    ClientOptions, ConnectionState, RealtimeClient, RealtimeError, Result, StaticConnectivity,
    Transport, TransportFactory, TransportListener, TransportState,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// How the fake service behaves for new transports and requests
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Open the socket and answer with `Connected`
    pub accept: bool,
    /// Answer attach/detach/close/heartbeat and ack publishes
    pub respond: bool,
    /// Keep the connection id when the attempt carries a resume token
    pub resume: bool,
    /// Fail the transport with this error instead of connecting
    pub refuse: Option<ErrorInfo>,
    /// Answer the connection with this `Error` instead of `Connected`
    pub reject: Option<ErrorInfo>,
    /// Hosts whose transports fail as if the network path were down
    pub unreachable_hosts: Vec<String>,
    pub connection_details: Option<ConnectionDetails>,
}

impl Script {
    pub fn cooperative() -> Self {
        Self {
            accept: true,
            respond: true,
            resume: true,
            ..Default::default()
        }
    }
}

struct FakeTransportInner {
    params: TransportParams,
    listener: TransportListener,
    script: Arc<Mutex<Script>>,
    connection_counter: Arc<AtomicUsize>,
    state: Mutex<TransportState>,
    sent: Mutex<Vec<ProtocolMessage>>,
}

/// Test-side view of one transport created by the engine
#[derive(Clone)]
pub struct FakeTransportHandle {
    inner: Arc<FakeTransportInner>,
}

impl FakeTransportHandle {
    pub fn params(&self) -> &TransportParams {
        &self.inner.params
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_actions(&self) -> Vec<Action> {
        self.inner.sent.lock().iter().map(|m| m.action).collect()
    }

    pub fn sent_with(&self, action: Action) -> Vec<ProtocolMessage> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|m| m.action == action)
            .cloned()
            .collect()
    }

    /// Open the socket without sending `Connected`
    pub fn open(&self) {
        *self.inner.state.lock() = TransportState::Connected;
        self.inner.listener.on_connected();
    }

    /// Deliver an inbound message
    pub fn receive(&self, message: ProtocolMessage) {
        self.inner.listener.on_message(message);
    }

    pub fn send_connected(&self, connection_id: &str) {
        let mut connected = ProtocolMessage::new(Action::Connected);
        connected.connection_id = Some(connection_id.to_string());
        let details = self.inner.script.lock().connection_details.clone().unwrap_or_default();
        connected.connection_details = Some(ConnectionDetails {
            connection_key: Some(format!("key-{}", connection_id)),
            ..details
        });
        self.receive(connected);
    }

    /// Drop the socket as if the network went away
    pub fn drop_connection(&self, reason: Option<ErrorInfo>) {
        *self.inner.state.lock() = TransportState::Closed;
        self.inner.listener.on_disconnected(reason);
    }

    pub fn fail(&self, error: ErrorInfo) {
        *self.inner.state.lock() = TransportState::Closed;
        self.inner.listener.on_error(error);
    }

    fn auto_reply(&self, message: &ProtocolMessage) -> Option<ProtocolMessage> {
        let channel = message.channel.clone().unwrap_or_default();
        match message.action {
            Action::Attach => Some(ProtocolMessage::new(Action::Attached).with_channel(channel)),
            Action::Detach => Some(ProtocolMessage::new(Action::Detached).with_channel(channel)),
            Action::Close => Some(ProtocolMessage::new(Action::Closed)),
            Action::Heartbeat => Some(ProtocolMessage::heartbeat(message.id.clone()?)),
            Action::Message | Action::Presence => Some(ProtocolMessage::ack(message.msg_serial?, 1)),
            _ => None,
        }
    }
}

struct FakeTransport {
    handle: FakeTransportHandle,
}

impl Transport for FakeTransport {
    fn state(&self) -> TransportState {
        self.handle.state()
    }

    fn connect(&self) {
        let inner = &self.handle.inner;
        let script = inner.script.lock().clone();
        if let Some(error) = script.refuse {
            self.handle.fail(error);
            return;
        }
        if script.unreachable_hosts.contains(&inner.params.host) {
            self.handle
                .fail(ErrorInfo::connection_failed(format!("{} unreachable", inner.params.host)));
            return;
        }
        if !script.accept {
            *inner.state.lock() = TransportState::Connecting;
            return;
        }
        self.handle.open();
        if let Some(error) = script.reject {
            self.handle
                .receive(ProtocolMessage::new(Action::Error).with_error(error));
            return;
        }
        let connection_id = match (&inner.params.resume, script.resume) {
            (Some(token), true) => token.connection_key.trim_start_matches("key-").to_string(),
            _ => format!("conn-{}", inner.connection_counter.fetch_add(1, Ordering::SeqCst) + 1),
        };
        self.handle.send_connected(&connection_id);
    }

    fn send(&self, message: ProtocolMessage) -> Result<()> {
        if self.handle.state() != TransportState::Connected {
            return Err(RealtimeError::ConnectionClosed("fake transport not connected".into()));
        }
        self.handle.inner.sent.lock().push(message.clone());
        if self.handle.inner.script.lock().respond {
            if let Some(reply) = self.handle.auto_reply(&message) {
                self.handle.receive(reply);
            }
        }
        Ok(())
    }

    fn close(&self) {
        *self.handle.inner.state.lock() = TransportState::Closed;
    }
}

/// Scripted in-memory service shared by every transport of a client
#[derive(Clone)]
pub struct FakeNetwork {
    script: Arc<Mutex<Script>>,
    transports: Arc<Mutex<Vec<FakeTransportHandle>>>,
    connection_counter: Arc<AtomicUsize>,
}

impl FakeNetwork {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            transports: Arc::new(Mutex::new(Vec::new())),
            connection_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn cooperative() -> Self {
        Self::new(Script::cooperative())
    }

    pub fn update(&self, change: impl FnOnce(&mut Script)) {
        change(&mut self.script.lock());
    }

    pub fn factory(&self) -> FakeTransportFactory {
        FakeTransportFactory {
            network: self.clone(),
        }
    }

    pub fn transports(&self) -> Vec<FakeTransportHandle> {
        self.transports.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last(&self) -> FakeTransportHandle {
        self.transports
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    /// Every message sent over every transport, in order
    pub fn all_sent(&self) -> Vec<ProtocolMessage> {
        self.transports().iter().flat_map(|t| t.sent()).collect()
    }
}

pub struct FakeTransportFactory {
    network: FakeNetwork,
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        listener: TransportListener,
    ) -> Result<Box<dyn Transport>> {
        let handle = FakeTransportHandle {
            inner: Arc::new(FakeTransportInner {
                params,
                listener,
                script: Arc::clone(&self.network.script),
                connection_counter: Arc::clone(&self.network.connection_counter),
                state: Mutex::new(TransportState::Initialized),
                sent: Mutex::new(Vec::new()),
            }),
        };
        self.network.transports.lock().push(handle.clone());
        Ok(Box::new(FakeTransport { handle }))
    }
}

/// Options with short timeouts for tests
pub fn test_options() -> ClientOptions {
    ClientOptions {
        realtime_request_timeout_ms: 1_000,
        disconnected_retry_timeout_ms: 2_000,
        max_retry_delay_ms: 8_000,
        suspended_retry_timeout_ms: 5_000,
        connection_state_ttl_ms: 20_000,
        auth_timeout_ms: 1_000,
        ..ClientOptions::default()
    }
}

/// Client wired to `network`, connecting immediately
pub fn client_with(network: &FakeNetwork, options: ClientOptions) -> RealtimeClient {
    client_with_probe(network, options, true)
}

/// Client whose connectivity probe always answers `reachable`
pub fn client_with_probe(
    network: &FakeNetwork,
    options: ClientOptions,
    reachable: bool,
) -> RealtimeClient {
    RealtimeClient::builder()
        .key("app.key:secret")
        .options(options)
        .transport_factory(network.factory())
        .connectivity_probe(StaticConnectivity(reachable))
        .build()
        .expect("client builds")
}

/// Client that believes the internet is unreachable, so it never tries fallback hosts
pub fn offline_client(network: &FakeNetwork) -> RealtimeClient {
    client_with_probe(network, test_options(), false)
}

pub fn test_client(network: &FakeNetwork) -> RealtimeClient {
    client_with(network, test_options())
}

/// Wait for a connection state, failing the test after 60 (virtual) seconds
pub async fn wait_for_state(client: &RealtimeClient, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(60), client.connection().when_state(state))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {}, still {}",
                state,
                client.connection().state()
            )
        })
        .expect("engine running");
}

/// Let the engine drain its inbox
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// A minimal realtime service over WebSocket
///
/// Answers every connection with `Connected`, attaches and detaches on
/// request, acks every publish, echoes heartbeats and closes on `Close`.
pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
    shutdown: Arc<Notify>,
}

impl MockRealtimeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let queries = Arc::new(Mutex::new(Vec::new()));
        let shutdown_clone = shutdown.clone();
        let queries_clone = queries.clone();

        tokio::spawn(async move {
            let mut connections = 0usize;
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                connections += 1;
                                let shutdown = shutdown_clone.clone();
                                let queries = queries_clone.clone();
                                let connection_id = format!("mock-{}", connections);
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, connection_id, queries, shutdown).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            queries,
            shutdown,
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        connection_id: String,
        queries: Arc<Mutex<Vec<String>>>,
        shutdown: Arc<Notify>,
    ) {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
        use tokio_tungstenite::tungstenite::Message as Frame;

        let record_query = |request: &Request, response: Response| {
            queries
                .lock()
                .push(request.uri().query().unwrap_or_default().to_string());
            Ok::<_, ErrorResponse>(response)
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, record_query).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let frame = |message: ProtocolMessage| match encode(&message) {
            Ok(WsMessage::Text(text)) => Frame::Text(text),
            Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes),
            Err(e) => panic!("encode failed: {}", e),
        };

        let (mut write, mut read) = ws_stream.split();

        let mut connected = ProtocolMessage::new(Action::Connected);
        connected.connection_id = Some(connection_id.clone());
        connected.connection_details = Some(ConnectionDetails {
            connection_key: Some(format!("key-{}", connection_id)),
            ..Default::default()
        });
        if write.send(frame(connected)).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Frame::Text(text))) => text,
                        Some(Ok(Frame::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    let Ok(request) = serde_json::from_str::<ProtocolMessage>(&text) else {
                        continue;
                    };
                    let channel = request.channel.clone().unwrap_or_default();
                    let reply = match request.action {
                        Action::Attach => Some(ProtocolMessage::new(Action::Attached).with_channel(channel)),
                        Action::Detach => Some(ProtocolMessage::new(Action::Detached).with_channel(channel)),
                        Action::Heartbeat => request.id.clone().map(ProtocolMessage::heartbeat),
                        Action::Message | Action::Presence => {
                            request.msg_serial.map(|serial| ProtocolMessage::ack(serial, 1))
                        }
                        Action::Close => {
                            let _ = write.send(frame(ProtocolMessage::new(Action::Closed))).await;
                            let _ = write.close().await;
                            break;
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if write.send(frame(reply)).await.is_err() {
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    /// Query strings of every accepted connection
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
