//! # Collaborator contracts
//!
//! Traits the connection engine consumes at its boundaries:
//!
//! - **Transport / TransportFactory**: one physical duplex connection per attempt
//! - **AuthProvider**: credential lookup and token renewal
//! - **ReconnectionStrategy**: delay between attempts
//! - **ConnectivityProbe**: internet reachability check before using a fallback host

pub mod auth;
pub mod connectivity;
pub mod error;
pub mod reconnect;
pub mod transport;

// Re-export commonly used types
pub use auth::{
    AuthCredential, AuthProvider, KeyAuth, StaticTokenAuth, TokenCallback, TokenCallbackAuth,
    TokenDetails,
};
pub use connectivity::{
    ConnectivityProbe, HttpConnectivityProbe, StaticConnectivity, DEFAULT_CONNECTIVITY_CHECK_URL,
};
pub use error::{RealtimeError, Result};
pub use reconnect::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};
pub use transport::{Transport, TransportEvent, TransportFactory, TransportListener, TransportState};
