use crate::core::params::TransportParams;
use crate::error::Result;
use crate::protocol::{ErrorInfo, ProtocolMessage};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a single physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Initialized = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl TransportState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Initialized,
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

/// Events a transport reports back to the connection engine
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The physical connection is open; protocol handshake still pending
    Connected,
    /// The physical connection closed, with the reason if it was not clean
    Disconnected(Option<ErrorInfo>),
    /// The transport failed to connect or broke
    Error(ErrorInfo),
    /// A decoded inbound envelope
    MessageReceived(ProtocolMessage),
}

type EventSink = Arc<dyn Fn(u64, TransportEvent) + Send + Sync>;

/// Handle a transport uses to report events
///
/// Each listener is stamped with the id of the transport it was created for;
/// the engine ignores events from transports it has already replaced.
#[derive(Clone)]
pub struct TransportListener {
    transport_id: u64,
    sink: EventSink,
}

impl TransportListener {
    pub fn new<F>(transport_id: u64, sink: F) -> Self
    where
        F: Fn(u64, TransportEvent) + Send + Sync + 'static,
    {
        Self {
            transport_id,
            sink: Arc::new(sink),
        }
    }

    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(self.transport_id, event);
    }

    pub fn on_connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn on_disconnected(&self, reason: Option<ErrorInfo>) {
        self.emit(TransportEvent::Disconnected(reason));
    }

    pub fn on_error(&self, error: ErrorInfo) {
        self.emit(TransportEvent::Error(error));
    }

    pub fn on_message(&self, message: ProtocolMessage) {
        self.emit(TransportEvent::MessageReceived(message));
    }
}

impl fmt::Debug for TransportListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportListener")
            .field("transport_id", &self.transport_id)
            .finish()
    }
}

/// One physical duplex connection
///
/// Implementations must not block: `connect` starts the connection in the
/// background and reports the outcome through the listener.
pub trait Transport: Send + Sync {
    /// Current physical connection state
    fn state(&self) -> TransportState;

    /// Start connecting
    fn connect(&self);

    /// Send an envelope; fails if the transport is not connected
    fn send(&self, message: ProtocolMessage) -> Result<()>;

    /// Close the connection and release its resources
    fn close(&self);
}

/// Creates a transport for each connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        params: TransportParams,
        listener: TransportListener,
    ) -> Result<Box<dyn Transport>>;
}
