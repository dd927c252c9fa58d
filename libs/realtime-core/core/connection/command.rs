use super::Metrics;
use crate::core::ack::AckCallback;
use crate::core::channel::state_machine::ChannelTimer;
use crate::core::channel::ChannelShared;
use crate::error::Result;
use crate::protocol::{ErrorInfo, Message};
use crate::traits::{AuthCredential, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// One-shot reply to a handle waiting on the engine
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Timers the engine can arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Bounds a single connection attempt
    ConnectAttempt,
    /// Moves `Disconnected`/`Suspended` back to `Connecting`
    Retry,
    /// Forces `Closed` when the service never answers `Close`
    ForceClose,
    /// No inbound activity for longer than the idle interval
    Idle,
    /// Bounds the wait for the service to confirm an in-band token
    Authorize,
    Ping(String),
    Channel(String, ChannelTimer),
}

/// Everything the engine reacts to arrives as a command
pub enum Command {
    Connect,
    Close,
    Ping(Reply<Duration>),
    Authorize(Reply<()>),
    Metrics(oneshot::Sender<Metrics>),

    AddChannel(Arc<ChannelShared>),
    Attach {
        channel: Arc<ChannelShared>,
        reply: Option<Reply<()>>,
    },
    Detach {
        channel: Arc<ChannelShared>,
        reply: Option<Reply<()>>,
    },
    Publish {
        channel: Arc<ChannelShared>,
        messages: Vec<Message>,
        callback: Option<AckCallback>,
    },
    Release {
        channel: String,
    },

    Transport {
        transport_id: u64,
        event: TransportEvent,
    },
    TimerFired {
        timer: TimerKind,
        id: u64,
    },
    CredentialReady {
        attempt: u64,
        result: std::result::Result<AuthCredential, ErrorInfo>,
    },
    AuthRenewed {
        result: std::result::Result<AuthCredential, ErrorInfo>,
    },
    ConnectivityChecked {
        attempt: u64,
        reachable: bool,
    },

    Shutdown,
}
