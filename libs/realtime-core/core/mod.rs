//! # Connection and channel engine
//!
//! One `RealtimeClient` owns one logical connection to the service and any
//! number of named channels multiplexed over it. All state lives in a single
//! engine task; the public handles send it commands and read lock-free
//! mirrors of its state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use realtime_core::{ConnectionState, RealtimeClient};
//!
//! #[tokio::main]
//! async fn main() -> realtime_core::Result<()> {
//!     let client = RealtimeClient::builder()
//!         .key("appId.keyId:secret")
//!         .build()?;
//!
//!     client.connection().when_state(ConnectionState::Connected).await?;
//!
//!     let channel = client.channel("updates");
//!     let mut messages = channel.subscribe();
//!     channel.attach().await?;
//!     channel.publish("greeting", "hello").await?;
//!
//!     while let Some(message) = messages.recv().await {
//!         println!("{:?}: {:?}", message.name, message.data);
//!     }
//!     client.shutdown().await
//! }
//! ```

pub mod ack;
pub mod auth_coordinator;
pub mod blocking;
pub mod builder;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod connection_state;
pub mod events;
pub mod params;
pub mod policy;
pub mod timer;
pub mod websocket;

// Re-export main types
pub use blocking::{BlockingChannel, BlockingConnection, BlockingSubscription};
pub use builder::{states, RealtimeClientBuilder};
pub use channel::{Channel, ChannelState, ChannelStateChange};
pub use client::{Channels, RealtimeClient};
pub use config::{ClientOptions, ConfigError};
pub use connection::{ClientEvent, Connection, ConnectionIdentity, Metrics};
pub use connection_state::{ConnectionState, ConnectionStateChange};
pub use events::Subscription;
pub use params::{ResumeToken, TransportParams};
pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

/// Create a new client builder
pub fn builder() -> RealtimeClientBuilder<builder::states::NoCredentials> {
    RealtimeClientBuilder::new()
}
