//! Configuration types for the transport and the session.
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `TransportConfig` | Polling and retransmission | `lan()`, `lossy()`, `unbounded()` |
//! | `SessionConfig` | Handshake, spawn and reconnect timing | `lan()`, `unbounded()` |
//!
//! # Example
//!
//! ```
//! use netchan_client::{SessionConfig, TransportConfig};
//! use web_time::Duration;
//!
//! let config = SessionConfig {
//!     transport: TransportConfig::lossy(),
//!     spawn_timeout: Some(Duration::from_secs(60)),
//!     ..SessionConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::NetchanError;

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 34;

fn check_duration(
    field: &'static str,
    value: Duration,
    min: Duration,
    max: Duration,
) -> Result<(), NetchanError> {
    if value < min || value > max {
        return Err(NetchanError::InvalidConfig {
            info: format!(
                "{field} must be between {}ms and {}ms, got {}ms",
                min.as_millis(),
                max.as_millis(),
                value.as_millis()
            ),
        });
    }
    Ok(())
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), NetchanError> {
    if value < min || value > max {
        return Err(NetchanError::InvalidConfig {
            info: format!("{field} must be between {min} and {max}, got {value}"),
        });
    }
    Ok(())
}

/// Configuration for the datagram transport.
///
/// Reliable sends resend their datagram every `resend_every_polls` receive
/// polls, so the effective resend period is
/// `poll_interval * resend_every_polls` (500ms with the defaults).
///
/// New fields may be added; construct with `..TransportConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TransportConfig has no effect unless passed to a Transport or SessionConfig"]
pub struct TransportConfig {
    /// Longest a single receive blocks before giving up.
    ///
    /// Also bounds how long a closed transport takes to wake its receivers.
    ///
    /// Default: 50ms
    pub poll_interval: Duration,

    /// Receive polls between retransmissions of an unacknowledged reliable
    /// datagram.
    ///
    /// Default: 10
    pub resend_every_polls: u32,

    /// Retransmissions after which a reliable send gives up with
    /// [`NetchanError::TransportStalled`]. `None` retries forever.
    ///
    /// Default: `Some(120)` (one minute at the default cadence)
    pub max_retransmissions: Option<u32>,

    /// Datagrams a reliable send may set aside for the receive loop while it
    /// waits for its acknowledgement. Older ones are dropped beyond this.
    ///
    /// Default: 256
    pub recv_backlog_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            resend_every_polls: 10,
            max_retransmissions: Some(120),
            recv_backlog_limit: 256,
        }
    }
}

impl TransportConfig {
    /// Creates a new `TransportConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for local networks: short polls, quick resends, early give-up.
    pub fn lan() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            resend_every_polls: 5,
            max_retransmissions: Some(50),
            recv_backlog_limit: 256,
        }
    }

    /// Preset for lossy links: default cadence, ten minutes of retrying.
    pub fn lossy() -> Self {
        Self {
            max_retransmissions: Some(1200),
            recv_backlog_limit: 1024,
            ..Self::default()
        }
    }

    /// Never gives up on a reliable send.
    pub fn unbounded() -> Self {
        Self {
            max_retransmissions: None,
            ..Self::default()
        }
    }

    /// Time between retransmissions of a reliable datagram.
    #[must_use]
    pub fn resend_period(&self) -> Duration {
        self.poll_interval * self.resend_every_polls
    }

    /// Validates the transport configuration.
    ///
    /// # Errors
    ///
    /// Returns `NetchanError::InvalidConfig` if any value is out of range.
    pub fn validate(&self) -> Result<(), NetchanError> {
        check_duration(
            "poll_interval",
            self.poll_interval,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )?;
        check_range(
            "resend_every_polls",
            u64::from(self.resend_every_polls),
            1,
            1000,
        )?;
        if let Some(max) = self.max_retransmissions {
            check_range("max_retransmissions", u64::from(max), 1, 1_000_000)?;
        }
        check_range(
            "recv_backlog_limit",
            self.recv_backlog_limit as u64,
            1,
            65536,
        )?;
        Ok(())
    }
}

/// Configuration for a [`Session`](crate::Session).
///
/// New fields may be added; construct with `..SessionConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SessionConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct SessionConfig {
    /// Transport settings, used for every connection the session opens.
    pub transport: TransportConfig,

    /// Version number sent in the connect request.
    ///
    /// Default: [`PROTOCOL_VERSION`]
    pub protocol_version: u32,

    /// How long each handshake step waits for its reply.
    ///
    /// Default: 10s
    pub handshake_timeout: Duration,

    /// How often a handshake request is repeated while waiting.
    ///
    /// Default: 1s
    pub handshake_resend_interval: Duration,

    /// How long `connect` waits for the player to spawn after the handshake.
    /// `None` waits forever.
    ///
    /// Default: `Some(30s)`
    pub spawn_timeout: Option<Duration>,

    /// Lower bound of the random delay before reconnecting after a map change.
    ///
    /// Default: 1s
    pub reconnect_backoff_min: Duration,

    /// Upper bound of the reconnect delay.
    ///
    /// Default: 4s
    pub reconnect_backoff_max: Duration,

    /// Serialize world access against the receive loop, so that a
    /// [`with_world`](crate::Session::with_world) closure never sees a
    /// half-applied datagram. Adds latency to both sides.
    ///
    /// Default: false
    pub high_thread_safety: bool,

    /// Send the pending move every iteration even before the player spawned.
    ///
    /// Default: true
    pub send_moves_before_spawn: bool,

    /// Seed for reconnect jitter. `None` seeds from entropy.
    ///
    /// Default: `None`
    pub rng_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            protocol_version: PROTOCOL_VERSION,
            handshake_timeout: Duration::from_secs(10),
            handshake_resend_interval: Duration::from_secs(1),
            spawn_timeout: Some(Duration::from_secs(30)),
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(4),
            high_thread_safety: false,
            send_moves_before_spawn: true,
            rng_seed: None,
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for a server on the local network.
    pub fn lan() -> Self {
        Self {
            transport: TransportConfig::lan(),
            handshake_timeout: Duration::from_secs(2),
            handshake_resend_interval: Duration::from_millis(250),
            spawn_timeout: Some(Duration::from_secs(10)),
            reconnect_backoff_min: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Waits forever for the spawn and for reliable acknowledgements.
    pub fn unbounded() -> Self {
        Self {
            transport: TransportConfig::unbounded(),
            spawn_timeout: None,
            ..Self::default()
        }
    }

    /// Validates the session configuration, transport included.
    ///
    /// # Errors
    ///
    /// Returns `NetchanError::InvalidConfig` if any value is out of range.
    pub fn validate(&self) -> Result<(), NetchanError> {
        self.transport.validate()?;
        if self.protocol_version == 0 {
            return Err(NetchanError::InvalidConfig {
                info: "protocol_version must be non-zero".to_owned(),
            });
        }
        check_duration(
            "handshake_timeout",
            self.handshake_timeout,
            Duration::from_millis(1),
            Duration::from_secs(300),
        )?;
        check_duration(
            "handshake_resend_interval",
            self.handshake_resend_interval,
            Duration::from_millis(1),
            self.handshake_timeout,
        )?;
        if let Some(spawn_timeout) = self.spawn_timeout {
            check_duration(
                "spawn_timeout",
                spawn_timeout,
                Duration::from_millis(1),
                Duration::from_secs(600),
            )?;
        }
        check_duration(
            "reconnect_backoff_max",
            self.reconnect_backoff_max,
            Duration::ZERO,
            Duration::from_secs(60),
        )?;
        check_duration(
            "reconnect_backoff_min",
            self.reconnect_backoff_min,
            Duration::ZERO,
            self.reconnect_backoff_max,
        )?;
        Ok(())
    }
}
