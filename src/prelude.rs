//! Convenient re-exports for common usage.
//!
//! ```rust
//! use netchan_client::prelude::*;
//!
//! let session: Session = SessionBuilder::new()
//!     .with_config(SessionConfig::lan())
//!     .build()
//!     .unwrap();
//! assert_eq!(session.state(), ConnectionState::Idle);
//! ```

pub use crate::error::NetchanError;
pub use crate::network::commands::{Action, MoveCommand};
pub use crate::network::messages::ServerMessage;
pub use crate::network::network_stats::NetworkStats;
pub use crate::recorder::{DatagramRecorder, FileRecorder, RecordPhase};
pub use crate::sessions::builder::SessionBuilder;
pub use crate::sessions::client_id::ClientIdAllocator;
pub use crate::sessions::config::{SessionConfig, TransportConfig};
pub use crate::sessions::session::Session;
pub use crate::sessions::state::ConnectionState;
pub use crate::world::{GameState, World, WorldObserver};
