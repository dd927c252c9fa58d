//! Bundled WebSocket transport built on tokio-tungstenite
//!
//! One `WebSocketTransport` per connection attempt. `connect` spawns a task
//! that owns the socket; outbound frames reach it through an unbounded
//! channel and everything inbound is decoded and handed to the listener.

use crate::core::params::TransportParams;
use crate::error::{RealtimeError, Result};
use crate::protocol::{decode, encode, ErrorInfo, Format, WsMessage};
use crate::traits::{Transport, TransportFactory, TransportListener, TransportState};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Creates a `WebSocketTransport` for every connection attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        params: TransportParams,
        listener: TransportListener,
    ) -> Result<Box<dyn Transport>> {
        if params.format == Format::MsgPack {
            return Err(RealtimeError::Configuration(
                "the WebSocket transport only speaks the json format".into(),
            ));
        }
        let url = params.url()?;
        Ok(Box::new(WebSocketTransport::new(url, listener)))
    }
}

struct TransportShared {
    state: AtomicU8,
    /// Set by `close`; silences the listener for the rest of the socket's life
    closed_locally: AtomicBool,
}

impl TransportShared {
    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }
}

pub struct WebSocketTransport {
    url: Url,
    listener: TransportListener,
    shared: Arc<TransportShared>,
    writer: Mutex<Option<UnboundedSender<Message>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: Url, listener: TransportListener) -> Self {
        Self {
            url,
            listener,
            shared: Arc::new(TransportShared {
                state: AtomicU8::new(TransportState::Initialized as u8),
                closed_locally: AtomicBool::new(false),
            }),
            writer: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Host and port only; the query string carries credentials
    fn endpoint(&self) -> String {
        format!(
            "{}://{}:{}",
            self.url.scheme(),
            self.url.host_str().unwrap_or_default(),
            self.url.port_or_known_default().unwrap_or_default()
        )
    }
}

impl Transport for WebSocketTransport {
    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn connect(&self) {
        if self.shared.state() != TransportState::Initialized {
            warn!("Transport {} already started", self.listener.transport_id());
            return;
        }
        self.shared.set_state(TransportState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.lock() = Some(tx);

        let handle = tokio::spawn(run_socket(
            self.url.clone(),
            self.endpoint(),
            self.listener.clone(),
            Arc::clone(&self.shared),
            rx,
        ));
        *self.task.lock() = Some(handle);
    }

    fn send(&self, message: crate::protocol::ProtocolMessage) -> Result<()> {
        if self.shared.state() != TransportState::Connected {
            return Err(RealtimeError::ConnectionClosed(format!(
                "transport is {:?}",
                self.shared.state()
            )));
        }
        let frame = ws_message_to_tungstenite(encode(&message)?);
        match self.writer.lock().as_ref() {
            Some(writer) => writer
                .send(frame)
                .map_err(|e| RealtimeError::ChannelSend(e.to_string())),
            None => Err(RealtimeError::ConnectionClosed("writer gone".into())),
        }
    }

    fn close(&self) {
        if self.shared.closed_locally.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.shared.state() {
            TransportState::Connected => {
                // Dropping the writer lets the socket task send a close frame
                self.shared.set_state(TransportState::Closing);
                self.writer.lock().take();
            }
            TransportState::Connecting => {
                if let Some(task) = self.task.lock().take() {
                    task.abort();
                }
                self.writer.lock().take();
                self.shared.set_state(TransportState::Closed);
            }
            _ => self.shared.set_state(TransportState::Closed),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_socket(
    url: Url,
    endpoint: String,
    listener: TransportListener,
    shared: Arc<TransportShared>,
    mut outbound: UnboundedReceiver<Message>,
) {
    let transport_id = listener.transport_id();
    debug!("Transport {} connecting to {}", transport_id, endpoint);

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            shared.set_state(TransportState::Closed);
            if !shared.is_closed_locally() {
                error!("Failed to connect to {}: {}", endpoint, e);
                listener.on_error(ErrorInfo::connection_failed(format!(
                    "Failed to connect to {}: {}",
                    endpoint, e
                )));
            }
            return;
        }
    };

    if shared.is_closed_locally() {
        shared.set_state(TransportState::Closed);
        return;
    }
    info!("Transport {} connected to {}", transport_id, endpoint);
    shared.set_state(TransportState::Connected);
    listener.on_connected();

    let (mut write, mut read) = ws_stream.split();

    let outcome: std::result::Result<(), ErrorInfo> = loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(frame)) => {
                    let Some(frame) = tungstenite_to_ws_message(frame) else {
                        continue;
                    };
                    match decode(&frame) {
                        Ok(message) => {
                            if !shared.is_closed_locally() {
                                listener.on_message(message);
                            }
                        }
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    }
                }
                Some(Err(e)) => {
                    break Err(ErrorInfo::disconnected(format!("WebSocket error: {}", e)));
                }
                None => break Ok(()),
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(frame).await {
                        break Err(ErrorInfo::disconnected(format!("WebSocket send failed: {}", e)));
                    }
                }
                None => {
                    debug!("Transport {} closing", transport_id);
                    let _ = write.close().await;
                    break Ok(());
                }
            },
        }
    };

    shared.set_state(TransportState::Closed);
    if shared.is_closed_locally() {
        debug!("Transport {} closed", transport_id);
        return;
    }
    match outcome {
        Ok(()) => {
            info!("Transport {} closed by peer", transport_id);
            listener.on_disconnected(None);
        }
        Err(error) => {
            warn!("Transport {} lost: {}", transport_id, error);
            listener.on_disconnected(Some(error));
        }
    }
}

fn ws_message_to_tungstenite(msg: WsMessage) -> Message {
    match msg {
        WsMessage::Text(text) => Message::Text(text),
        WsMessage::Binary(data) => Message::Binary(data),
    }
}

fn tungstenite_to_ws_message(msg: Message) -> Option<WsMessage> {
    match msg {
        Message::Text(text) => Some(WsMessage::Text(text)),
        Message::Binary(data) => Some(WsMessage::Binary(data)),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}
