use crate::protocol::ErrorInfo;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    Initialized = 0,
    Attaching = 1,
    Attached = 2,
    Detaching = 3,
    Detached = 4,
    Suspended = 5,
    Failed = 6,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Initialized,
            1 => ChannelState::Attaching,
            2 => ChannelState::Attached,
            3 => ChannelState::Detaching,
            4 => ChannelState::Detached,
            5 => ChannelState::Suspended,
            _ => ChannelState::Failed,
        }
    }

    /// Attaching or attached: the states the connection forces on failure
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Attaching | ChannelState::Attached)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Emitted on every channel state transition
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub channel: String,
    pub previous: ChannelState,
    pub current: ChannelState,
    pub reason: Option<ErrorInfo>,
    /// Set on `Attached` when the service kept the channel's continuity
    pub resumed: bool,
}

#[derive(Debug)]
pub struct AtomicChannelState(AtomicU8);

impl AtomicChannelState {
    pub fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
