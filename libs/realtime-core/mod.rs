//! # realtime-core
//!
//! Client-side protocol engine for a realtime pub/sub service: one logical
//! connection over a persistent duplex transport, multiplexed across named
//! channels, with at-least-once delivery through sequence-numbered ACK/NACK.
//!
//! ## Features
//!
//! - **Single-owner engine**: connection and channel state machines driven by one task
//! - **At-least-once publishing**: pending acks replayed in order after a reconnect
//! - **Resilient connection**: backoff, suspension, fallback hosts, resume/recover
//! - **Pluggable collaborators**: transport, auth provider, connectivity probe, retry strategies
//! - **Type-state builder**: a client cannot be built without a credential source

pub mod traits;
pub mod protocol;
pub mod core;

// Re-export all traits
pub use traits::*;
pub use traits::error;

// Re-export core client functionality
pub use crate::core::{
    blocking, builder, channel, client, config, connection, connection_state,
    builder::{states, RealtimeClientBuilder},
    blocking::{BlockingChannel, BlockingConnection},
    channel::{Channel, ChannelState, ChannelStateChange},
    client::{Channels, RealtimeClient},
    config::{ClientOptions, ConfigError},
    connection::{ClientEvent, Connection, Metrics},
    connection_state::{ConnectionState, ConnectionStateChange},
    events::Subscription,
    websocket::WebSocketTransportFactory,
};

pub use protocol::{codes, Action, ErrorInfo, Message, PresenceMessage, ProtocolMessage};

// Convenience function
pub use crate::core::builder as client_builder;
