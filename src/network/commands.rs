//! Client-to-server payloads.
//!
//! A connected client sends one of two kinds of frame body:
//!
//! - a **move**, which always has the same size ([`MOVE_PAYLOAD_SIZE`]) so a
//!   receiver can step over it without parsing, and
//! - a **string command** (or other variable-length op) that runs to the end
//!   of the datagram. Only one variable-length op goes in each datagram.

use serde::{Deserialize, Serialize};

use crate::network::codec::{self, angle_to_short, CodecResult};

/// Client op tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ClientOp {
    Bad = 0,
    Nop = 1,
    Move = 2,
    UserInfo = 3,
    StringCommand = 4,
}

/// Encoded size of a [`MovePayload`], tag included.
pub const MOVE_PAYLOAD_SIZE: usize = 21;

/// Movement speeds are clamped to what fits in the wire field.
const MAX_SPEED: f32 = i16::MAX as f32;

/// Buttons and impulse accompanying a move.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Action {
    /// Fire the current weapon.
    pub attack: bool,
    /// Use / activate.
    pub use_item: bool,
    /// Impulse number (weapon switch and the like), 0 for none.
    pub impulse: u8,
}

impl Action {
    const BUTTON_ATTACK: u8 = 1;
    const BUTTON_USE: u8 = 2;
    /// Set by the engine whenever any key is down; servers use it to skip
    /// intermission.
    const BUTTON_ANY: u8 = 128;

    /// No buttons, no impulse.
    pub const IDLE: Self = Self {
        attack: false,
        use_item: false,
        impulse: 0,
    };

    /// Holding the attack button.
    #[must_use]
    pub const fn attack() -> Self {
        Self {
            attack: true,
            use_item: false,
            impulse: 0,
        }
    }

    /// Wire encoding of the held buttons.
    #[must_use]
    pub const fn buttons(self) -> u8 {
        let mut bits = 0;
        if self.attack {
            bits |= Self::BUTTON_ATTACK;
        }
        if self.use_item {
            bits |= Self::BUTTON_USE;
        }
        if bits != 0 {
            bits |= Self::BUTTON_ANY;
        }
        bits
    }
}

/// What the caller wants the controlled player to do on the next tick.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MoveCommand {
    /// View angles in degrees: pitch, yaw, roll.
    pub angles: [f32; 3],
    /// Forward, side and up speed.
    pub velocity: [f32; 3],
    /// Buttons and impulse.
    pub action: Action,
}

impl MoveCommand {
    /// Creates a move command.
    #[must_use]
    pub const fn new(angles: [f32; 3], velocity: [f32; 3], action: Action) -> Self {
        Self {
            angles,
            velocity,
            action,
        }
    }

    /// Builds the fixed-width wire payload.
    ///
    /// `last_frame` is the newest server frame we hold (for delta
    /// compression), `msec` the time the move covers.
    #[must_use]
    pub fn to_payload(&self, last_frame: i32, msec: u8) -> MovePayload {
        let speed = |v: f32| v.clamp(-MAX_SPEED, MAX_SPEED) as i16;
        MovePayload {
            op: ClientOp::Move as u8,
            last_frame,
            msec,
            angles: self.angles.map(angle_to_short),
            velocity: self.velocity.map(speed),
            buttons: self.action.buttons(),
            impulse: self.action.impulse,
            light_level: 0,
        }
    }
}

/// The fixed-width move structure as it appears on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MovePayload {
    /// Always [`ClientOp::Move`].
    pub op: u8,
    /// Newest server frame received, -1 for none.
    pub last_frame: i32,
    /// Duration of this move in milliseconds.
    pub msec: u8,
    /// View angles as 16-bit fractions of a turn.
    pub angles: [i16; 3],
    /// Forward, side and up speed.
    pub velocity: [i16; 3],
    /// Button bits.
    pub buttons: u8,
    /// Impulse.
    pub impulse: u8,
    /// Ambient light at the player, unused by servers.
    pub light_level: u8,
}

/// The body of an outbound client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPayload {
    /// A movement update.
    Move(MovePayload),
    /// A console command for the server.
    StringCommand(String),
    /// Updated user info string.
    UserInfo(String),
    /// Nothing; keeps the channel alive.
    Nop,
}

impl ClientPayload {
    /// Appends the encoded payload to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> CodecResult<()> {
        match self {
            Self::Move(payload) => {
                codec::encode_append(payload, out)?;
            },
            Self::StringCommand(text) => push_string_op(out, ClientOp::StringCommand, text),
            Self::UserInfo(text) => push_string_op(out, ClientOp::UserInfo, text),
            Self::Nop => out.push(ClientOp::Nop as u8),
        }
        Ok(())
    }

    /// Number of bytes [`encode_into`](Self::encode_into) appends.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Move(_) => MOVE_PAYLOAD_SIZE,
            Self::StringCommand(text) | Self::UserInfo(text) => {
                text.bytes().filter(|&b| b != 0).count() + 2
            },
            Self::Nop => 1,
        }
    }

    /// Whether the payload has a fixed size.
    #[must_use]
    pub const fn is_fixed_width(&self) -> bool {
        matches!(self, Self::Move(_) | Self::Nop)
    }
}

fn push_string_op(out: &mut Vec<u8>, op: ClientOp, text: &str) {
    out.push(op as u8);
    out.extend(text.bytes().filter(|&b| b != 0));
    out.push(0);
}
