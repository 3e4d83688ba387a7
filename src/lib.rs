//! # netchan-client
//!
//! A client for the Quake II network channel (protocol 34): the UDP framing
//! with packed sequence numbers, alternating-bit reliability, the
//! connectionless challenge handshake and a background worker that keeps a
//! decoded copy of the game world up to date.
//!
//! The API is blocking and thread-based. [`Session::connect`] returns once
//! the player has spawned; from then on a worker thread applies every server
//! frame to the session's [`World`], notifies observers when the frame
//! number advances and sends the pending move each iteration.
//!
//! ```no_run
//! use netchan_client::{Action, GameState, Session, SessionBuilder, World};
//!
//! let session: Session<GameState> = SessionBuilder::new()
//!     .with_profile("\\name\\walker\\skin\\male/grunt")
//!     .with_observer(|world: &GameState| {
//!         if let Some(me) = world.controlled_entity() {
//!             tracing::info!(origin = ?me.origin, "frame");
//!         }
//!     })
//!     .build()?;
//! session.connect("127.0.0.1", 27910)?;
//! session.set_pending_move([0.0, 90.0, 0.0], [200.0, 0.0, 0.0], Action::IDLE);
//! session.send_command("say hello")?;
//! session.disconnect();
//! # Ok::<(), netchan_client::NetchanError>(())
//! ```
//!
//! Protocol anomalies are reported through [`telemetry`] rather than
//! returned, since the channel is expected to recover from them on its own.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::NetchanError;
pub use network::commands::{Action, ClientPayload, MoveCommand};
pub use network::frame::{ServerFrame, WireFrame};
pub use network::messages::{MessageCatalog, ServerMessage, ServerOp};
pub use network::network_stats::NetworkStats;
pub use network::sequence::SequenceNumber;
pub use network::transport::Transport;
pub use network::udp_socket::{DatagramSocket, UdpDatagramSocket};
pub use recorder::{DatagramRecorder, FileRecorder, RecordPhase};
pub use sessions::builder::{SessionBuilder, DEFAULT_PROFILE};
pub use sessions::client_id::{ClientIdAllocator, ClientIdLease};
pub use sessions::config::{SessionConfig, TransportConfig, PROTOCOL_VERSION};
pub use sessions::session::Session;
pub use sessions::state::{ConnectionState, HandshakeStage};
pub use world::{EntityState, GameState, PlayerState, World, WorldObserver};

#[doc(hidden)]
pub mod error;
pub mod prelude;
pub mod recorder;
/// Internal random number generator module based on PCG32.
///
/// Drives reconnect jitter and client-id allocation; seedable for tests.
pub mod rng;
pub mod telemetry;
pub mod world;

/// Session layer: handshake, worker loop and configuration.
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    pub mod client_id;
    pub mod config;
    pub mod handshake;
    #[doc(hidden)]
    pub mod session;
    pub mod state;
}

/// Wire format and transport.
pub mod network {
    /// Binary codec for fixed-layout payloads and the server message reader.
    pub mod codec;
    pub mod commands;
    pub mod frame;
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    pub mod reliability;
    pub mod sequence;
    pub mod transport;
    pub mod udp_socket;
}

/// Internal module exposing implementation details for testing, fuzzing and
/// benchmarks.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here may change
/// without notice and is not covered by semver.
#[doc(hidden)]
pub mod __internal {
    pub use crate::network::codec::{ByteReader, CodecError};
    pub use crate::network::frame::{
        connectionless_text, is_connectionless_datagram, DecodedMessage, FrameError, MessageList,
        HEADER_SIZE,
    };
    pub use crate::network::reliability::{ObserveOutcome, ReliabilityState};
    pub use crate::sessions::handshake::{connect_request, ConnectionlessReply};
}
