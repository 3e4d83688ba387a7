//! Connection state machine.
//!
//! ```text
//!                 connect()
//!     ┌──────┐  send getchallenge  ┌───────────────────┐
//!     │ Idle │ ───────────────────>│ AwaitingChallenge │
//!     └──────┘                     └─────────┬─────────┘
//!                                            │ "challenge N"
//!                                            │ send connect
//!                                            v
//!                                  ┌────────────────────┐
//!                                  │ AwaitingConnectAck │
//!                                  └─────────┬──────────┘
//!                                            │ "client_connect"
//!                                            │ send reliable "new"
//!                                            v
//!  reconnect (new transport)       ┌────────────────────────────┐
//!  ┌──────────────────────────────>│ Connected { in_game: false}│
//!  │                               └─────────┬──────────────────┘
//!  │                                         │ first entity snapshot
//!  │                                         v
//!  │                               ┌────────────────────────────┐
//!  └───────────────────────────────│ Connected { in_game: true }│
//!     server "reconnect"           └─────────┬──────────────────┘
//!                                            │ disconnect() or server "disconnect"
//!                                            v
//!                                    ┌──────────────┐
//!                                    │ Disconnected │
//!                                    └──────────────┘
//! ```
//!
//! Any handshake state moves to `Disconnected` on timeout or rejection.
//! During a reconnect the session passes through the handshake states again.

use std::fmt;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Created but never connected.
    #[default]
    Idle,
    /// Sent `getchallenge`, waiting for the challenge number.
    AwaitingChallenge,
    /// Sent `connect`, waiting for `client_connect`.
    AwaitingConnectAck,
    /// Handshake complete.
    Connected {
        /// Whether the server has sent the first entity snapshot.
        in_game: bool,
    },
    /// Closed by either side, or the handshake failed.
    Disconnected,
}

impl ConnectionState {
    /// Whether the handshake has completed and the session is live.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether the player is in the game world.
    #[must_use]
    pub const fn is_in_game(self) -> bool {
        matches!(self, Self::Connected { in_game: true })
    }

    /// The handshake step this state waits on, if any.
    #[must_use]
    pub const fn handshake_stage(self) -> Option<HandshakeStage> {
        match self {
            Self::AwaitingChallenge => Some(HandshakeStage::AwaitingChallenge),
            Self::AwaitingConnectAck => Some(HandshakeStage::AwaitingConnectAck),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AwaitingChallenge => f.write_str("awaiting challenge"),
            Self::AwaitingConnectAck => f.write_str("awaiting connect ack"),
            Self::Connected { in_game: false } => f.write_str("connected"),
            Self::Connected { in_game: true } => f.write_str("in game"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A handshake step that can time out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    /// Waiting for `challenge N`.
    AwaitingChallenge,
    /// Waiting for `client_connect`.
    AwaitingConnectAck,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingChallenge => f.write_str("awaiting challenge"),
            Self::AwaitingConnectAck => f.write_str("awaiting connect acknowledgement"),
        }
    }
}
