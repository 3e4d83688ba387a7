//! Server-to-client messages and the tag-indexed decoder catalog.
//!
//! After the 8-byte sequence pair, a server frame is a run of messages. Each
//! message starts with a one-byte tag and carries a layout that tells the
//! decoder how long it is. [`MessageCatalog`] maps tags to decoder functions
//! through a 256-entry table; the standard catalog registers tags `0..=20`.

use serde::{Deserialize, Serialize};

use crate::network::codec::{ByteReader, CodecResult};

/// Number of item slots in an inventory update.
pub const MAX_ITEMS: usize = 256;
/// Number of player stat slots.
pub const MAX_STATS: usize = 32;

/// Message tags sent by the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ServerOp {
    Bad = 0,
    MuzzleFlash = 1,
    MuzzleFlash2 = 2,
    TempEntity = 3,
    Layout = 4,
    Inventory = 5,
    Nop = 6,
    Disconnect = 7,
    Reconnect = 8,
    Sound = 9,
    Print = 10,
    StuffText = 11,
    ServerData = 12,
    ConfigString = 13,
    SpawnBaseline = 14,
    CenterPrint = 15,
    Download = 16,
    PlayerInfo = 17,
    PacketEntities = 18,
    DeltaPacketEntities = 19,
    Frame = 20,
}

impl ServerOp {
    /// Highest registered tag.
    pub const LAST: u8 = Self::Frame as u8;

    /// Maps a raw tag onto a known op.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Bad,
            1 => Self::MuzzleFlash,
            2 => Self::MuzzleFlash2,
            3 => Self::TempEntity,
            4 => Self::Layout,
            5 => Self::Inventory,
            6 => Self::Nop,
            7 => Self::Disconnect,
            8 => Self::Reconnect,
            9 => Self::Sound,
            10 => Self::Print,
            11 => Self::StuffText,
            12 => Self::ServerData,
            13 => Self::ConfigString,
            14 => Self::SpawnBaseline,
            15 => Self::CenterPrint,
            16 => Self::Download,
            17 => Self::PlayerInfo,
            18 => Self::PacketEntities,
            19 => Self::DeltaPacketEntities,
            20 => Self::Frame,
            _ => return None,
        })
    }
}

/// Severity attached to a print message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrintLevel {
    /// Pickup messages.
    Low,
    /// Death messages.
    Medium,
    /// Critical messages.
    High,
    /// Player chat.
    Chat,
    /// A level byte outside the known range.
    Other(u8),
}

impl From<u8> for PrintLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            3 => Self::Chat,
            other => Self::Other(other),
        }
    }
}

impl From<PrintLevel> for u8 {
    fn from(level: PrintLevel) -> Self {
        match level {
            PrintLevel::Low => 0,
            PrintLevel::Medium => 1,
            PrintLevel::High => 2,
            PrintLevel::Chat => 3,
            PrintLevel::Other(other) => other,
        }
    }
}

/// Payload of a server-data message, sent once per level load.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerData {
    /// Protocol version the server speaks.
    pub protocol: i32,
    /// Incremented on each level change; echoed back in `begin`.
    pub server_count: i32,
    /// Non-zero while a demo is playing.
    pub attract_loop: u8,
    /// Game directory (mod) name.
    pub game_dir: String,
    /// Our player slot; the controlled entity is `player_num + 1`.
    pub player_num: i16,
    /// Human-readable level name.
    pub level_name: String,
}

/// Positional sound event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SoundEvent {
    /// Config-string index of the sound.
    pub sound_index: u8,
    /// Volume in `[0, 1]`.
    pub volume: f32,
    /// Attenuation factor.
    pub attenuation: f32,
    /// Start offset in seconds.
    pub time_offset: f32,
    /// Emitting entity, if any.
    pub entity: Option<u16>,
    /// Channel on the emitting entity.
    pub channel: u8,
    /// Explicit position, if any.
    pub position: Option<[f32; 3]>,
}

/// Header of a server snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Server frame number of this snapshot.
    pub server_frame: i32,
    /// Frame this snapshot is delta-compressed against, or -1.
    pub delta_frame: i32,
    /// Number of frames the server suppressed because of rate limits.
    pub suppress_count: u8,
    /// Potentially-visible area bits.
    pub area_bits: Vec<u8>,
}

/// Entity state fields present in one delta.
///
/// Fields the delta does not carry are `None` and keep their previous value
/// when applied to a world.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityDelta {
    /// Entity number; zero terminates a packet-entities list.
    pub number: u16,
    /// Raw update bits as read from the wire.
    pub bits: u32,
    /// The entity left the snapshot.
    pub remove: bool,
    /// Model indices (primary plus three attached models).
    pub model_index: [Option<u8>; 4],
    /// Animation frame.
    pub frame: Option<u16>,
    /// Skin number.
    pub skin: Option<u32>,
    /// Effect flags.
    pub effects: Option<u32>,
    /// Render flags.
    pub render_fx: Option<u32>,
    /// Per-axis origin updates.
    pub origin: [Option<f32>; 3],
    /// Per-axis angle updates.
    pub angles: [Option<f32>; 3],
    /// Previous origin for lerping.
    pub old_origin: Option<[f32; 3]>,
    /// Looping sound index.
    pub sound: Option<u8>,
    /// One-shot event.
    pub event: Option<u8>,
    /// Encoded bounding box.
    pub solid: Option<u16>,
}

/// Player movement type reported in player info.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveType {
    /// Normal movement.
    Normal,
    /// Free-flying spectator.
    Spectator,
    /// Dead, no movement.
    Dead,
    /// Gibbed.
    Gib,
    /// Frozen, e.g. during intermission.
    Freeze,
    /// Unknown value.
    Other(u8),
}

impl MoveType {
    /// Whether a player in this state is alive in the world.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl From<u8> for MoveType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Spectator,
            2 => Self::Dead,
            3 => Self::Gib,
            4 => Self::Freeze,
            other => Self::Other(other),
        }
    }
}

/// Changes to the local player's state carried by a player-info message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerStateDelta {
    /// Raw flag word.
    pub flags: u16,
    /// Movement type.
    pub move_type: Option<MoveType>,
    /// Origin.
    pub origin: Option<[f32; 3]>,
    /// Velocity.
    pub velocity: Option<[f32; 3]>,
    /// Movement timer.
    pub move_time: Option<u8>,
    /// Movement flags.
    pub move_flags: Option<u8>,
    /// Gravity.
    pub gravity: Option<i16>,
    /// Delta angles applied by the server.
    pub delta_angles: Option<[f32; 3]>,
    /// Eye offset.
    pub view_offset: Option<[f32; 3]>,
    /// View angles.
    pub view_angles: Option<[f32; 3]>,
    /// Kick angles.
    pub kick_angles: Option<[f32; 3]>,
    /// Weapon model index.
    pub gun_index: Option<u8>,
    /// Weapon frame with its offset and angles.
    pub gun_frame: Option<(u8, [f32; 3], [f32; 3])>,
    /// Screen blend RGBA.
    pub blend: Option<[f32; 4]>,
    /// Field of view.
    pub fov: Option<u8>,
    /// Refresh flags.
    pub rd_flags: Option<u8>,
    /// Updated stats as `(slot, value)` pairs.
    pub stats: Vec<(u8, i16)>,
}

/// One decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A tag without a decoder, or a message whose layout ran past the end
    /// of the datagram. Carries everything from the tag byte to the end.
    Bad {
        /// The tag that could not be decoded.
        tag: u8,
        /// Offset of the tag byte within the datagram.
        offset: usize,
        /// The swallowed bytes, tag included.
        bytes: Vec<u8>,
    },
    /// Player weapon flash.
    MuzzleFlash {
        /// Entity that fired.
        entity: u16,
        /// Weapon flash kind.
        weapon: u8,
    },
    /// Monster weapon flash.
    MuzzleFlash2 {
        /// Entity that fired.
        entity: u16,
        /// Flash index.
        flash: u8,
    },
    /// HUD layout program.
    Layout(String),
    /// Complete inventory counts.
    Inventory(Box<[i16; MAX_ITEMS]>),
    /// Does nothing.
    Nop,
    /// The server is dropping us.
    Disconnect,
    /// The server is changing levels and wants us to reconnect.
    Reconnect,
    /// A sound started playing.
    Sound(SoundEvent),
    /// Text for the console.
    Print {
        /// Severity.
        level: PrintLevel,
        /// Message text.
        text: String,
    },
    /// Console commands the server asks the client to run.
    StuffText(String),
    /// Level information; starts a new connection phase.
    ServerData(ServerData),
    /// One config string (model names, player names, ...).
    ConfigString {
        /// Slot index.
        index: u16,
        /// New value.
        text: String,
    },
    /// Baseline state for an entity.
    SpawnBaseline(EntityDelta),
    /// Text for the center of the screen.
    CenterPrint(String),
    /// A chunk of a file download.
    Download {
        /// Chunk size, -1 if the file is unavailable.
        size: i16,
        /// Completion percentage.
        percent: u8,
        /// Chunk data.
        data: Vec<u8>,
    },
    /// Local player state.
    PlayerInfo(PlayerStateDelta),
    /// Entity updates for the current snapshot.
    PacketEntities {
        /// Whether this is the delta-compressed variant.
        delta: bool,
        /// Entity deltas, terminator excluded.
        entities: Vec<EntityDelta>,
    },
    /// Snapshot header.
    Frame(FrameHeader),
}

impl ServerMessage {
    /// Tag this message was decoded from.
    #[must_use]
    pub fn op(&self) -> ServerOp {
        match self {
            Self::Bad { .. } => ServerOp::Bad,
            Self::MuzzleFlash { .. } => ServerOp::MuzzleFlash,
            Self::MuzzleFlash2 { .. } => ServerOp::MuzzleFlash2,
            Self::Layout(_) => ServerOp::Layout,
            Self::Inventory(_) => ServerOp::Inventory,
            Self::Nop => ServerOp::Nop,
            Self::Disconnect => ServerOp::Disconnect,
            Self::Reconnect => ServerOp::Reconnect,
            Self::Sound(_) => ServerOp::Sound,
            Self::Print { .. } => ServerOp::Print,
            Self::StuffText(_) => ServerOp::StuffText,
            Self::ServerData(_) => ServerOp::ServerData,
            Self::ConfigString { .. } => ServerOp::ConfigString,
            Self::SpawnBaseline(_) => ServerOp::SpawnBaseline,
            Self::CenterPrint(_) => ServerOp::CenterPrint,
            Self::Download { .. } => ServerOp::Download,
            Self::PlayerInfo(_) => ServerOp::PlayerInfo,
            Self::PacketEntities { delta: false, .. } => ServerOp::PacketEntities,
            Self::PacketEntities { delta: true, .. } => ServerOp::DeltaPacketEntities,
            Self::Frame(_) => ServerOp::Frame,
        }
    }

    /// Whether this is an entity snapshot.
    #[must_use]
    pub const fn is_entity_snapshot(&self) -> bool {
        matches!(self, Self::PacketEntities { .. })
    }
}

/// A message decoder. Reads the message body; the tag is already consumed.
pub type Decoder = fn(&mut ByteReader<'_>) -> CodecResult<ServerMessage>;

/// Lookup table from message tag to decoder.
#[derive(Clone, Copy)]
pub struct MessageCatalog {
    decoders: [Option<Decoder>; 256],
}

impl MessageCatalog {
    /// A catalog without any decoders; every message decodes as `Bad`.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            decoders: [None; 256],
        }
    }

    /// The catalog for protocol 34.
    ///
    /// Temp-entity messages have no decoder: their layout depends on a long
    /// table of effect types and the client has no use for them. Register a
    /// decoder for [`ServerOp::TempEntity`] to consume them.
    #[must_use]
    pub fn standard() -> Self {
        let mut catalog = Self::empty();
        catalog.register(ServerOp::MuzzleFlash as u8, decode_muzzle_flash);
        catalog.register(ServerOp::MuzzleFlash2 as u8, decode_muzzle_flash2);
        catalog.register(ServerOp::Layout as u8, decode_layout);
        catalog.register(ServerOp::Inventory as u8, decode_inventory);
        catalog.register(ServerOp::Nop as u8, |_| Ok(ServerMessage::Nop));
        catalog.register(ServerOp::Disconnect as u8, |_| Ok(ServerMessage::Disconnect));
        catalog.register(ServerOp::Reconnect as u8, |_| Ok(ServerMessage::Reconnect));
        catalog.register(ServerOp::Sound as u8, decode_sound);
        catalog.register(ServerOp::Print as u8, decode_print);
        catalog.register(ServerOp::StuffText as u8, decode_stuff_text);
        catalog.register(ServerOp::ServerData as u8, decode_server_data);
        catalog.register(ServerOp::ConfigString as u8, decode_config_string);
        catalog.register(ServerOp::SpawnBaseline as u8, decode_spawn_baseline);
        catalog.register(ServerOp::CenterPrint as u8, decode_center_print);
        catalog.register(ServerOp::Download as u8, decode_download);
        catalog.register(ServerOp::PlayerInfo as u8, decode_player_info);
        catalog.register(ServerOp::PacketEntities as u8, |r| {
            decode_packet_entities(r, false)
        });
        catalog.register(ServerOp::DeltaPacketEntities as u8, |r| {
            decode_packet_entities(r, true)
        });
        catalog.register(ServerOp::Frame as u8, decode_frame);
        catalog
    }

    /// Installs `decoder` for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: u8, decoder: Decoder) {
        self.decoders[tag as usize] = Some(decoder);
    }

    /// Removes the decoder for `tag`.
    pub fn unregister(&mut self, tag: u8) {
        self.decoders[tag as usize] = None;
    }

    /// Whether `tag` has a decoder.
    #[must_use]
    pub fn is_registered(&self, tag: u8) -> bool {
        self.decoders[tag as usize].is_some()
    }

    /// Decodes the message starting at `offset`.
    ///
    /// Returns the message and the number of bytes it occupied. When the tag
    /// has no decoder, or the decoder runs out of input, the result is
    /// [`ServerMessage::Bad`] spanning the rest of `bytes`: without a length
    /// the position of any following message is unknown.
    ///
    /// `offset` must be inside `bytes`.
    #[must_use]
    pub fn decode(&self, bytes: &[u8], offset: usize) -> (ServerMessage, usize) {
        let tag = bytes[offset];
        let bad = || {
            (
                ServerMessage::Bad {
                    tag,
                    offset,
                    bytes: bytes[offset..].to_vec(),
                },
                bytes.len() - offset,
            )
        };
        let Some(decoder) = self.decoders[tag as usize] else {
            return bad();
        };
        let mut reader = ByteReader::at(bytes, offset + 1);
        match decoder(&mut reader) {
            Ok(message) => (message, reader.position() - offset),
            Err(_) => bad(),
        }
    }
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for MessageCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<usize> = self
            .decoders
            .iter()
            .enumerate()
            .filter_map(|(tag, d)| d.map(|_| tag))
            .collect();
        f.debug_struct("MessageCatalog")
            .field("registered", &registered)
            .finish()
    }
}

// Entity update bits.
const U_ORIGIN1: u32 = 1 << 0;
const U_ORIGIN2: u32 = 1 << 1;
const U_ANGLE2: u32 = 1 << 2;
const U_ANGLE3: u32 = 1 << 3;
const U_FRAME8: u32 = 1 << 4;
const U_EVENT: u32 = 1 << 5;
const U_REMOVE: u32 = 1 << 6;
const U_MOREBITS1: u32 = 1 << 7;
const U_NUMBER16: u32 = 1 << 8;
const U_ORIGIN3: u32 = 1 << 9;
const U_ANGLE1: u32 = 1 << 10;
const U_MODEL: u32 = 1 << 11;
const U_RENDERFX8: u32 = 1 << 12;
const U_EFFECTS8: u32 = 1 << 14;
const U_MOREBITS2: u32 = 1 << 15;
const U_SKIN8: u32 = 1 << 16;
const U_FRAME16: u32 = 1 << 17;
const U_RENDERFX16: u32 = 1 << 18;
const U_EFFECTS16: u32 = 1 << 19;
const U_MODEL2: u32 = 1 << 20;
const U_MODEL3: u32 = 1 << 21;
const U_MODEL4: u32 = 1 << 22;
const U_MOREBITS3: u32 = 1 << 23;
const U_OLDORIGIN: u32 = 1 << 24;
const U_SKIN16: u32 = 1 << 25;
const U_SOUND: u32 = 1 << 26;
const U_SOLID: u32 = 1 << 27;

// Player state flags.
const PS_M_TYPE: u16 = 1 << 0;
const PS_M_ORIGIN: u16 = 1 << 1;
const PS_M_VELOCITY: u16 = 1 << 2;
const PS_M_TIME: u16 = 1 << 3;
const PS_M_FLAGS: u16 = 1 << 4;
const PS_M_GRAVITY: u16 = 1 << 5;
const PS_M_DELTA_ANGLES: u16 = 1 << 6;
const PS_VIEWOFFSET: u16 = 1 << 7;
const PS_VIEWANGLES: u16 = 1 << 8;
const PS_KICKANGLES: u16 = 1 << 9;
const PS_BLEND: u16 = 1 << 10;
const PS_FOV: u16 = 1 << 11;
const PS_WEAPONINDEX: u16 = 1 << 12;
const PS_WEAPONFRAME: u16 = 1 << 13;
const PS_RDFLAGS: u16 = 1 << 14;

// Sound flags.
const SND_VOLUME: u8 = 1 << 0;
const SND_ATTENUATION: u8 = 1 << 1;
const SND_POS: u8 = 1 << 2;
const SND_ENT: u8 = 1 << 3;
const SND_OFFSET: u8 = 1 << 4;

fn decode_muzzle_flash(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::MuzzleFlash {
        entity: r.read_u16()?,
        weapon: r.read_u8()?,
    })
}

fn decode_muzzle_flash2(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::MuzzleFlash2 {
        entity: r.read_u16()?,
        flash: r.read_u8()?,
    })
}

fn decode_layout(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::Layout(r.read_string()?))
}

fn decode_inventory(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let mut items = Box::new([0i16; MAX_ITEMS]);
    for item in items.iter_mut() {
        *item = r.read_i16()?;
    }
    Ok(ServerMessage::Inventory(items))
}

fn decode_sound(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let flags = r.read_u8()?;
    let sound_index = r.read_u8()?;
    let volume = if flags & SND_VOLUME != 0 {
        f32::from(r.read_u8()?) / 255.0
    } else {
        1.0
    };
    let attenuation = if flags & SND_ATTENUATION != 0 {
        f32::from(r.read_u8()?) / 64.0
    } else {
        1.0
    };
    let time_offset = if flags & SND_OFFSET != 0 {
        f32::from(r.read_u8()?) / 1000.0
    } else {
        0.0
    };
    let (entity, channel) = if flags & SND_ENT != 0 {
        let packed = r.read_u16()?;
        (Some(packed >> 3), (packed & 7) as u8)
    } else {
        (None, 0)
    };
    let position = if flags & SND_POS != 0 {
        Some(r.read_position()?)
    } else {
        None
    };
    Ok(ServerMessage::Sound(SoundEvent {
        sound_index,
        volume,
        attenuation,
        time_offset,
        entity,
        channel,
        position,
    }))
}

fn decode_print(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::Print {
        level: PrintLevel::from(r.read_u8()?),
        text: r.read_string()?,
    })
}

fn decode_stuff_text(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::StuffText(r.read_string()?))
}

fn decode_server_data(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::ServerData(ServerData {
        protocol: r.read_i32()?,
        server_count: r.read_i32()?,
        attract_loop: r.read_u8()?,
        game_dir: r.read_string()?,
        player_num: r.read_i16()?,
        level_name: r.read_string()?,
    }))
}

fn decode_config_string(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::ConfigString {
        index: r.read_u16()?,
        text: r.read_string()?,
    })
}

fn decode_spawn_baseline(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let (bits, number) = read_entity_header(r)?;
    Ok(ServerMessage::SpawnBaseline(read_entity_delta(
        r, bits, number,
    )?))
}

fn decode_center_print(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    Ok(ServerMessage::CenterPrint(r.read_string()?))
}

fn decode_download(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let size = r.read_i16()?;
    let percent = r.read_u8()?;
    let data = if size > 0 {
        r.read_bytes(size as usize)?.to_vec()
    } else {
        Vec::new()
    };
    Ok(ServerMessage::Download {
        size,
        percent,
        data,
    })
}

fn read_small_vector(r: &mut ByteReader<'_>) -> CodecResult<[f32; 3]> {
    Ok([
        f32::from(r.read_i8()?) * 0.25,
        f32::from(r.read_i8()?) * 0.25,
        f32::from(r.read_i8()?) * 0.25,
    ])
}

fn decode_player_info(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let flags = r.read_u16()?;
    let mut ps = PlayerStateDelta {
        flags,
        ..PlayerStateDelta::default()
    };
    if flags & PS_M_TYPE != 0 {
        ps.move_type = Some(MoveType::from(r.read_u8()?));
    }
    if flags & PS_M_ORIGIN != 0 {
        ps.origin = Some(r.read_position()?);
    }
    if flags & PS_M_VELOCITY != 0 {
        ps.velocity = Some(r.read_position()?);
    }
    if flags & PS_M_TIME != 0 {
        ps.move_time = Some(r.read_u8()?);
    }
    if flags & PS_M_FLAGS != 0 {
        ps.move_flags = Some(r.read_u8()?);
    }
    if flags & PS_M_GRAVITY != 0 {
        ps.gravity = Some(r.read_i16()?);
    }
    if flags & PS_M_DELTA_ANGLES != 0 {
        ps.delta_angles = Some([r.read_angle16()?, r.read_angle16()?, r.read_angle16()?]);
    }
    if flags & PS_VIEWOFFSET != 0 {
        ps.view_offset = Some(read_small_vector(r)?);
    }
    if flags & PS_VIEWANGLES != 0 {
        ps.view_angles = Some([r.read_angle16()?, r.read_angle16()?, r.read_angle16()?]);
    }
    if flags & PS_KICKANGLES != 0 {
        ps.kick_angles = Some(read_small_vector(r)?);
    }
    if flags & PS_WEAPONINDEX != 0 {
        ps.gun_index = Some(r.read_u8()?);
    }
    if flags & PS_WEAPONFRAME != 0 {
        let frame = r.read_u8()?;
        let offset = read_small_vector(r)?;
        let angles = read_small_vector(r)?;
        ps.gun_frame = Some((frame, offset, angles));
    }
    if flags & PS_BLEND != 0 {
        let mut blend = [0.0f32; 4];
        for channel in &mut blend {
            *channel = f32::from(r.read_u8()?) / 255.0;
        }
        ps.blend = Some(blend);
    }
    if flags & PS_FOV != 0 {
        ps.fov = Some(r.read_u8()?);
    }
    if flags & PS_RDFLAGS != 0 {
        ps.rd_flags = Some(r.read_u8()?);
    }
    let stat_bits = r.read_u32()?;
    for slot in 0..MAX_STATS {
        if stat_bits & (1 << slot) != 0 {
            ps.stats.push((slot as u8, r.read_i16()?));
        }
    }
    Ok(ServerMessage::PlayerInfo(ps))
}

/// Reads the variable-width update bits and the entity number.
fn read_entity_header(r: &mut ByteReader<'_>) -> CodecResult<(u32, u16)> {
    let mut bits = u32::from(r.read_u8()?);
    if bits & U_MOREBITS1 != 0 {
        bits |= u32::from(r.read_u8()?) << 8;
    }
    if bits & U_MOREBITS2 != 0 {
        bits |= u32::from(r.read_u8()?) << 16;
    }
    if bits & U_MOREBITS3 != 0 {
        bits |= u32::from(r.read_u8()?) << 24;
    }
    let number = if bits & U_NUMBER16 != 0 {
        r.read_u16()?
    } else {
        u16::from(r.read_u8()?)
    };
    Ok((bits, number))
}

/// Reads a value whose width is selected by a pair of bits: both set means
/// 32 bits, otherwise 8 or 16.
fn read_sized(r: &mut ByteReader<'_>, bits: u32, bit8: u32, bit16: u32) -> CodecResult<Option<u32>> {
    Ok(if bits & bit8 != 0 && bits & bit16 != 0 {
        Some(r.read_u32()?)
    } else if bits & bit8 != 0 {
        Some(u32::from(r.read_u8()?))
    } else if bits & bit16 != 0 {
        Some(u32::from(r.read_u16()?))
    } else {
        None
    })
}

fn read_entity_delta(r: &mut ByteReader<'_>, bits: u32, number: u16) -> CodecResult<EntityDelta> {
    let mut delta = EntityDelta {
        number,
        bits,
        remove: bits & U_REMOVE != 0,
        ..EntityDelta::default()
    };
    for (slot, flag) in [U_MODEL, U_MODEL2, U_MODEL3, U_MODEL4].into_iter().enumerate() {
        if bits & flag != 0 {
            delta.model_index[slot] = Some(r.read_u8()?);
        }
    }
    if bits & U_FRAME8 != 0 {
        delta.frame = Some(u16::from(r.read_u8()?));
    }
    if bits & U_FRAME16 != 0 {
        delta.frame = Some(r.read_u16()?);
    }
    delta.skin = read_sized(r, bits, U_SKIN8, U_SKIN16)?;
    delta.effects = read_sized(r, bits, U_EFFECTS8, U_EFFECTS16)?;
    delta.render_fx = read_sized(r, bits, U_RENDERFX8, U_RENDERFX16)?;
    for (axis, flag) in [U_ORIGIN1, U_ORIGIN2, U_ORIGIN3].into_iter().enumerate() {
        if bits & flag != 0 {
            delta.origin[axis] = Some(r.read_coord()?);
        }
    }
    for (axis, flag) in [U_ANGLE1, U_ANGLE2, U_ANGLE3].into_iter().enumerate() {
        if bits & flag != 0 {
            delta.angles[axis] = Some(r.read_angle()?);
        }
    }
    if bits & U_OLDORIGIN != 0 {
        delta.old_origin = Some(r.read_position()?);
    }
    if bits & U_SOUND != 0 {
        delta.sound = Some(r.read_u8()?);
    }
    if bits & U_EVENT != 0 {
        delta.event = Some(r.read_u8()?);
    }
    if bits & U_SOLID != 0 {
        delta.solid = Some(r.read_u16()?);
    }
    Ok(delta)
}

fn decode_packet_entities(r: &mut ByteReader<'_>, delta: bool) -> CodecResult<ServerMessage> {
    let mut entities = Vec::new();
    loop {
        let (bits, number) = read_entity_header(r)?;
        if number == 0 {
            break;
        }
        entities.push(read_entity_delta(r, bits, number)?);
    }
    Ok(ServerMessage::PacketEntities { delta, entities })
}

fn decode_frame(r: &mut ByteReader<'_>) -> CodecResult<ServerMessage> {
    let server_frame = r.read_i32()?;
    let delta_frame = r.read_i32()?;
    let suppress_count = r.read_u8()?;
    let area_len = r.read_u8()? as usize;
    let area_bits = r.read_bytes(area_len)?.to_vec();
    Ok(ServerMessage::Frame(FrameHeader {
        server_frame,
        delta_frame,
        suppress_count,
        area_bits,
    }))
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> (ServerMessage, usize) {
        MessageCatalog::standard().decode(bytes, 0)
    }

    #[test]
    fn server_op_covers_registered_range() {
        for tag in 0..=ServerOp::LAST {
            assert_eq!(ServerOp::from_u8(tag).map(|op| op as u8), Some(tag));
        }
        assert!(ServerOp::from_u8(ServerOp::LAST + 1).is_none());
    }

    #[test]
    fn nop_is_one_byte() {
        assert_eq!(decode_one(&[6]), (ServerMessage::Nop, 1));
    }

    #[test]
    fn print_reads_level_and_string() {
        let (msg, len) = decode_one(b"\x0a\x02hello\0");
        assert_eq!(
            msg,
            ServerMessage::Print {
                level: PrintLevel::High,
                text: "hello".to_owned()
            }
        );
        assert_eq!(len, 8);
    }

    #[test]
    fn server_data() {
        let mut bytes = vec![12];
        bytes.extend_from_slice(&34i32.to_le_bytes());
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(b"baseq2\0");
        bytes.extend_from_slice(&3i16.to_le_bytes());
        bytes.extend_from_slice(b"The Edge\0");
        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len());
        let ServerMessage::ServerData(data) = msg else {
            panic!("expected server data");
        };
        assert_eq!(data.protocol, 34);
        assert_eq!(data.server_count, 7);
        assert_eq!(data.game_dir, "baseq2");
        assert_eq!(data.player_num, 3);
        assert_eq!(data.level_name, "The Edge");
    }

    #[test]
    fn frame_header_with_area_bits() {
        let mut bytes = vec![20];
        bytes.extend_from_slice(&100i32.to_le_bytes());
        bytes.extend_from_slice(&98i32.to_le_bytes());
        bytes.extend_from_slice(&[0, 2, 0xAA, 0x55]);
        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len());
        assert_eq!(
            msg,
            ServerMessage::Frame(FrameHeader {
                server_frame: 100,
                delta_frame: 98,
                suppress_count: 0,
                area_bits: vec![0xAA, 0x55],
            })
        );
    }

    #[test]
    fn packet_entities_stop_at_zero_number() {
        // entity 5: origin1 (short 80 = 10.0) + event byte; entity 300 with
        // NUMBER16 via MOREBITS1 and REMOVE; then terminator.
        let mut bytes = vec![18];
        bytes.extend_from_slice(&[(U_ORIGIN1 | U_EVENT) as u8, 5, 80, 0, 1]);
        let bits = U_REMOVE | U_MOREBITS1 | U_NUMBER16;
        bytes.extend_from_slice(&[bits as u8, (bits >> 8) as u8]);
        bytes.extend_from_slice(&300u16.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.push(6);

        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len() - 1);
        let ServerMessage::PacketEntities { delta, entities } = msg else {
            panic!("expected packet entities");
        };
        assert!(!delta);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].number, 5);
        assert_eq!(entities[0].origin, [Some(10.0), None, None]);
        assert_eq!(entities[0].event, Some(1));
        assert_eq!(entities[1].number, 300);
        assert!(entities[1].remove);
    }

    #[test]
    fn sized_fields_pick_width_from_bit_pair() {
        let mut bytes = vec![14];
        let bits = U_MOREBITS1 | U_MOREBITS2 | U_MOREBITS3 | U_SKIN8 | U_SKIN16 | U_EFFECTS8;
        bytes.extend_from_slice(&bits.to_le_bytes());
        bytes.push(9);
        bytes.extend_from_slice(&0x0102_0304u32.to_le_bytes());
        bytes.push(0x40);
        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len());
        let ServerMessage::SpawnBaseline(delta) = msg else {
            panic!("expected baseline");
        };
        assert_eq!(delta.number, 9);
        assert_eq!(delta.skin, Some(0x0102_0304));
        assert_eq!(delta.effects, Some(0x40));
        assert_eq!(delta.render_fx, None);
    }

    #[test]
    fn player_info_reads_stats_after_flags() {
        let mut bytes = vec![17];
        bytes.extend_from_slice(&(PS_M_TYPE | PS_FOV).to_le_bytes());
        bytes.push(0);
        bytes.push(90);
        bytes.extend_from_slice(&0b101u32.to_le_bytes());
        bytes.extend_from_slice(&100i16.to_le_bytes());
        bytes.extend_from_slice(&(-5i16).to_le_bytes());
        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len());
        let ServerMessage::PlayerInfo(ps) = msg else {
            panic!("expected player info");
        };
        assert_eq!(ps.move_type, Some(MoveType::Normal));
        assert_eq!(ps.fov, Some(90));
        assert_eq!(ps.stats, vec![(0, 100), (2, -5)]);
    }

    #[test]
    fn sound_with_entity_and_position() {
        let mut bytes = vec![9, SND_ENT | SND_POS | SND_VOLUME, 4, 255];
        bytes.extend_from_slice(&((12u16 << 3) | 2).to_le_bytes());
        bytes.extend_from_slice(&[8, 0, 16, 0, 24, 0]);
        let (msg, len) = decode_one(&bytes);
        assert_eq!(len, bytes.len());
        let ServerMessage::Sound(sound) = msg else {
            panic!("expected sound");
        };
        assert_eq!(sound.sound_index, 4);
        assert_eq!(sound.volume, 1.0);
        assert_eq!(sound.entity, Some(12));
        assert_eq!(sound.channel, 2);
        assert_eq!(sound.position, Some([1.0, 2.0, 3.0]));
    }

    #[test]
    fn download_without_data() {
        let (msg, len) = decode_one(&[16, 0xFF, 0xFF, 0]);
        assert_eq!(len, 4);
        assert_eq!(
            msg,
            ServerMessage::Download {
                size: -1,
                percent: 0,
                data: Vec::new()
            }
        );
    }

    #[test]
    fn unknown_tag_swallows_remainder() {
        let bytes = [6, 200, 1, 2, 3];
        let (msg, len) = MessageCatalog::standard().decode(&bytes, 1);
        assert_eq!(len, 4);
        assert_eq!(
            msg,
            ServerMessage::Bad {
                tag: 200,
                offset: 1,
                bytes: vec![200, 1, 2, 3]
            }
        );
    }

    #[test]
    fn temp_entity_has_no_standard_decoder() {
        let catalog = MessageCatalog::standard();
        assert!(!catalog.is_registered(ServerOp::TempEntity as u8));
        assert!(!catalog.is_registered(ServerOp::Bad as u8));
        assert!(catalog.is_registered(ServerOp::Frame as u8));
    }

    #[test]
    fn truncated_message_decodes_as_bad() {
        let (msg, len) = decode_one(&[1, 0x10]);
        assert_eq!(len, 2);
        assert!(matches!(msg, ServerMessage::Bad { tag: 1, .. }));
    }

    #[test]
    fn registered_decoder_overrides_default() {
        let mut catalog = MessageCatalog::standard();
        catalog.register(ServerOp::TempEntity as u8, |r| {
            let _kind = r.read_u8()?;
            Ok(ServerMessage::Nop)
        });
        assert_eq!(catalog.decode(&[3, 9], 0), (ServerMessage::Nop, 2));
        catalog.unregister(ServerOp::TempEntity as u8);
        assert!(matches!(catalog.decode(&[3, 9], 0).0, ServerMessage::Bad { .. }));
    }

    #[test]
    fn op_round_trips_through_message() {
        assert_eq!(ServerMessage::Nop.op(), ServerOp::Nop);
        assert_eq!(
            ServerMessage::PacketEntities {
                delta: true,
                entities: Vec::new()
            }
            .op(),
            ServerOp::DeltaPacketEntities
        );
    }
}
