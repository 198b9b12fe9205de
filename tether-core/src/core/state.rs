//! Connection State - lifecycle of one streaming connection
//!
//! # State Diagram
//!
//! ```text
//!      DISCONNECTED ◄──────────────────────────────┐
//!           │                                      │
//!       connect()                            health failure
//!           ▼                                      │
//!      CONNECTING ──success──► CONNECTED ──auth──► AUTHENTICATED
//!           │                      │                    │
//!         fail                     └─────subscribe──────┤
//!           ▼                                           ▼
//!     RECONNECTING ◄────────── drop ────────────── SUBSCRIBED
//!           │
//!   retry budget exhausted
//!           ▼
//!        FAILED ──manual_retry()──► RECONNECTING
//! ```
//!
//! FAILED is only entered when the retry budget is exhausted or a
//! validation error makes the connection unrecoverable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Authoritative state of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Authenticated,
        ConnectionState::Subscribed,
        ConnectionState::Reconnecting,
        ConnectionState::Failed,
    ];

    /// Wire name, as persisted in the shared store
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Subscribed => "SUBSCRIBED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        }
    }

    /// Transport is up (with or without auth/subscriptions)
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticated | Self::Subscribed
        )
    }

    /// A connection attempt is underway
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting | Self::Connecting)
    }

    pub fn is_failed(&self) -> bool {
        *self == Self::Failed
    }

    /// Whether `self -> next` is an allowed transition
    ///
    /// Same-state transitions are always allowed (timestamp refresh).
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            // Anything but FAILED may fail or drop
            (from, Failed) => from != Failed,
            (_, Disconnected) => true,

            (Disconnected, Connecting | Reconnecting) => true,
            (Connecting, Connected | Reconnecting) => true,
            (Connected, Authenticated | Subscribed | Reconnecting) => true,
            (Authenticated, Subscribed | Reconnecting) => true,
            (Subscribed, Reconnecting) => true,
            (Reconnecting, Connecting | Connected) => true,
            // Manual retry
            (Failed, Reconnecting | Connecting) => true,

            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown connection state '{}'", s))
    }
}
