use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::sessions::state::HandshakeStage;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetchanError>`].
///
/// [`Result<(), NetchanError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NetchanError {
    /// The server host name did not resolve to any address.
    ResolveFailed {
        /// The host and port that failed to resolve.
        address: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
    /// The transport was closed while an operation was in progress.
    TransportClosed,
    /// A reliable send was not acknowledged within the retransmission budget.
    TransportStalled {
        /// How many times the datagram was resent before giving up.
        retransmissions: u32,
    },
    /// The server did not answer a handshake step in time.
    HandshakeTimeout {
        /// The step that was waiting.
        stage: HandshakeStage,
    },
    /// The server refused the connection.
    HandshakeRejected {
        /// The reason text the server sent, if any.
        reason: String,
    },
    /// The handshake completed but the player never spawned.
    SpawnTimeout,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A configuration value is out of range.
    InvalidConfig {
        /// Which value and why.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    Serialization {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
}

impl Display for NetchanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetchanError::ResolveFailed { address } => {
                write!(f, "Could not resolve server address {}", address)
            },
            NetchanError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
            NetchanError::TransportClosed => {
                write!(f, "The transport was closed.")
            },
            NetchanError::TransportStalled { retransmissions } => {
                write!(
                    f,
                    "Reliable message not acknowledged after {} retransmissions.",
                    retransmissions
                )
            },
            NetchanError::HandshakeTimeout { stage } => {
                write!(f, "Handshake timed out while {}", stage)
            },
            NetchanError::HandshakeRejected { reason } => {
                write!(f, "Server rejected the connection: {}", reason)
            },
            NetchanError::SpawnTimeout => {
                write!(f, "Connected, but the player did not spawn in time.")
            },
            NetchanError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            NetchanError::InvalidConfig { info } => {
                write!(f, "Invalid configuration: {}", info)
            },
            NetchanError::Serialization { context } => {
                write!(f, "Serialization error: {}", context)
            },
        }
    }
}

impl Error for NetchanError {}

impl From<std::io::Error> for NetchanError {
    fn from(err: std::io::Error) -> Self {
        NetchanError::SocketError {
            context: err.to_string(),
        }
    }
}

impl From<crate::network::codec::CodecError> for NetchanError {
    fn from(err: crate::network::codec::CodecError) -> Self {
        NetchanError::Serialization {
            context: err.to_string(),
        }
    }
}

impl From<crate::network::frame::FrameError> for NetchanError {
    fn from(err: crate::network::frame::FrameError) -> Self {
        NetchanError::Serialization {
            context: err.to_string(),
        }
    }
}
