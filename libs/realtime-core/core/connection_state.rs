//! Connection state and its lock-free mirror
//!
//! The engine task is the only writer; handles read the mirror to answer
//! `state()` queries and to reject invalid calls without a round trip.

use crate::protocol::ErrorInfo;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Initialized = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Suspended = 4,
    Closing = 5,
    Closed = 6,
    Failed = 7,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Initialized,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Suspended,
            5 => ConnectionState::Closing,
            6 => ConnectionState::Closed,
            _ => ConnectionState::Failed,
        }
    }

    /// Terminal until `connect()` is called again
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which outbound messages wait for the next `Connected`
    #[inline]
    pub fn queues_messages(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Disconnected
                | ConnectionState::Suspended
        )
    }

    /// States in which channels may not start attaching
    #[inline]
    pub fn rejects_channel_operations(self) -> bool {
        matches!(
            self,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Suspended
                | ConnectionState::Failed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Emitted on every connection state transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic attempt, when one is scheduled
    pub retry_in: Option<Duration>,
}

/// Atomic connection state readable from any thread
#[derive(Debug)]
pub struct AtomicConnectionState {
    state: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    #[inline]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

/// Counters updated by the engine task
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_count: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_reconnects(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }
}
