//! The decoded game world.
//!
//! A [`Session`](crate::Session) applies every decoded server message to a
//! [`World`]. The crate ships [`GameState`], which tracks what a simple
//! client needs: level info, config strings, the local player, the entity
//! table and the text the server printed. Applications with richer needs
//! implement [`World`] themselves.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::network::messages::{
    EntityDelta, MoveType, PlayerStateDelta, PrintLevel, ServerData, ServerMessage, MAX_ITEMS,
    MAX_STATS,
};

/// Config-string slot of the first model; the next slot holds the map.
pub const CS_MODELS: u16 = 32;

const PRINT_LOG_CAPACITY: usize = 64;

/// State built from server messages.
///
/// A fresh value (from [`Default`]) is created for every connection,
/// including each reconnect after a map change.
pub trait World: Default + Send + 'static {
    /// Applies one decoded message.
    ///
    /// Reliable messages may arrive more than once when an acknowledgement
    /// is lost, so application must be idempotent.
    fn apply(&mut self, message: &ServerMessage);

    /// Server frame number of the newest snapshot applied, if any.
    fn current_frame_number(&self) -> Option<i32>;

    /// Whether the controlled player is present and alive.
    fn is_spawned(&self) -> bool;
}

/// Receives the world after each datagram that advanced the frame number.
///
/// Called synchronously on the session's receive thread; keep it short.
/// Closures taking `&W` implement this trait.
pub trait WorldObserver<W>: Send + Sync {
    /// The world has advanced to a new frame.
    fn on_world_update(&self, world: &W);
}

impl<W, F> WorldObserver<W> for F
where
    F: Fn(&W) + Send + Sync,
{
    fn on_world_update(&self, world: &W) {
        self(world);
    }
}

/// Full state of one entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    /// Entity number.
    pub number: u16,
    /// Model indices.
    pub model_index: [u8; 4],
    /// Animation frame.
    pub frame: u16,
    /// Skin number.
    pub skin: u32,
    /// Effect flags.
    pub effects: u32,
    /// Render flags.
    pub render_fx: u32,
    /// Position.
    pub origin: [f32; 3],
    /// Orientation in degrees.
    pub angles: [f32; 3],
    /// Previous position.
    pub old_origin: [f32; 3],
    /// Looping sound.
    pub sound: u8,
    /// One-shot event of the current frame.
    pub event: u8,
    /// Encoded bounding box.
    pub solid: u16,
}

impl EntityState {
    /// A blank entity with the given number.
    #[must_use]
    pub fn new(number: u16) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }

    /// Overwrites the fields the delta carries.
    pub fn apply(&mut self, delta: &EntityDelta) {
        self.number = delta.number;
        for (slot, value) in self.model_index.iter_mut().zip(delta.model_index) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut self.frame, delta.frame);
        set(&mut self.skin, delta.skin);
        set(&mut self.effects, delta.effects);
        set(&mut self.render_fx, delta.render_fx);
        for (axis, value) in self.origin.iter_mut().zip(delta.origin) {
            set(axis, value);
        }
        for (axis, value) in self.angles.iter_mut().zip(delta.angles) {
            set(axis, value);
        }
        set(&mut self.old_origin, delta.old_origin);
        set(&mut self.sound, delta.sound);
        // Events last one frame.
        self.event = delta.event.unwrap_or(0);
        set(&mut self.solid, delta.solid);
    }
}

/// Accumulated state of the local player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Movement type; `None` until the server reports it.
    pub move_type: Option<MoveType>,
    /// Position.
    pub origin: [f32; 3],
    /// Velocity.
    pub velocity: [f32; 3],
    /// Gravity.
    pub gravity: i16,
    /// Server-applied angle offset.
    pub delta_angles: [f32; 3],
    /// Eye offset.
    pub view_offset: [f32; 3],
    /// View angles.
    pub view_angles: [f32; 3],
    /// Weapon model index.
    pub gun_index: u8,
    /// Field of view.
    pub fov: u8,
    /// HUD stats (health, ammo, armor, ...).
    pub stats: [i16; MAX_STATS],
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            move_type: None,
            origin: [0.0; 3],
            velocity: [0.0; 3],
            gravity: 0,
            delta_angles: [0.0; 3],
            view_offset: [0.0; 3],
            view_angles: [0.0; 3],
            gun_index: 0,
            fov: 90,
            stats: [0; MAX_STATS],
        }
    }
}

impl PlayerState {
    /// Overwrites the fields the delta carries.
    pub fn apply(&mut self, delta: &PlayerStateDelta) {
        if delta.move_type.is_some() {
            self.move_type = delta.move_type;
        }
        set(&mut self.origin, delta.origin);
        set(&mut self.velocity, delta.velocity);
        set(&mut self.gravity, delta.gravity);
        set(&mut self.delta_angles, delta.delta_angles);
        set(&mut self.view_offset, delta.view_offset);
        set(&mut self.view_angles, delta.view_angles);
        set(&mut self.gun_index, delta.gun_index);
        set(&mut self.fov, delta.fov);
        for &(slot, value) in &delta.stats {
            if let Some(stat) = self.stats.get_mut(slot as usize) {
                *stat = value;
            }
        }
    }

    /// Whether the player is alive. Players start alive; only a reported
    /// non-normal movement type says otherwise.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.move_type.is_none_or(MoveType::is_alive)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Default [`World`] implementation.
#[derive(Debug, Clone, Default)]
pub struct GameState {
    server_data: Option<ServerData>,
    config_strings: BTreeMap<u16, String>,
    baselines: BTreeMap<u16, EntityState>,
    entities: BTreeMap<u16, EntityState>,
    player: PlayerState,
    frame: Option<i32>,
    snapshots: u64,
    prints: VecDeque<(PrintLevel, String)>,
    center_print: Option<String>,
    inventory: Option<Box<[i16; MAX_ITEMS]>>,
    layout: Option<String>,
    bad_messages: u64,
}

impl GameState {
    /// An empty world.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Level information from the last server-data message.
    #[must_use]
    pub const fn server_data(&self) -> Option<&ServerData> {
        self.server_data.as_ref()
    }

    /// Entity number of the player this client controls.
    #[must_use]
    pub fn controlled_entity_number(&self) -> Option<u16> {
        let player_num = self.server_data.as_ref()?.player_num;
        u16::try_from(player_num).ok().map(|n| n + 1)
    }

    /// Current state of the controlled player's entity.
    #[must_use]
    pub fn controlled_entity(&self) -> Option<&EntityState> {
        self.entities.get(&self.controlled_entity_number()?)
    }

    /// A config string by slot.
    #[must_use]
    pub fn config_string(&self, index: u16) -> Option<&str> {
        self.config_strings.get(&index).map(String::as_str)
    }

    /// Path of the loaded map, e.g. `maps/q2dm1.bsp`.
    #[must_use]
    pub fn map_name(&self) -> Option<&str> {
        self.config_string(CS_MODELS + 1)
    }

    /// Local player state.
    #[must_use]
    pub const fn player(&self) -> &PlayerState {
        &self.player
    }

    /// Entities in the current snapshot.
    #[must_use]
    pub const fn entities(&self) -> &BTreeMap<u16, EntityState> {
        &self.entities
    }

    /// One entity of the current snapshot.
    #[must_use]
    pub fn entity(&self, number: u16) -> Option<&EntityState> {
        self.entities.get(&number)
    }

    /// Number of entity snapshots applied since the last level change.
    #[must_use]
    pub const fn snapshot_count(&self) -> u64 {
        self.snapshots
    }

    /// The most recent console prints, oldest first.
    pub fn prints(&self) -> impl Iterator<Item = &(PrintLevel, String)> {
        self.prints.iter()
    }

    /// Last center-screen message.
    #[must_use]
    pub fn center_print(&self) -> Option<&str> {
        self.center_print.as_deref()
    }

    /// Item counts from the last inventory message.
    #[must_use]
    pub fn inventory(&self) -> Option<&[i16; MAX_ITEMS]> {
        self.inventory.as_deref()
    }

    /// Last HUD layout program.
    #[must_use]
    pub fn layout(&self) -> Option<&str> {
        self.layout.as_deref()
    }

    /// Messages that could not be decoded.
    #[must_use]
    pub const fn bad_message_count(&self) -> u64 {
        self.bad_messages
    }

    fn apply_server_data(&mut self, data: &ServerData) {
        // A new level; nothing from the previous one carries over.
        *self = Self {
            server_data: Some(data.clone()),
            prints: std::mem::take(&mut self.prints),
            bad_messages: self.bad_messages,
            ..Self::default()
        };
    }

    fn apply_packet_entities(&mut self, delta: bool, entities: &[EntityDelta]) {
        if !delta {
            self.entities.clear();
        }
        for update in entities {
            if update.remove {
                self.entities.remove(&update.number);
                continue;
            }
            let mut state = self
                .entities
                .remove(&update.number)
                .or_else(|| self.baselines.get(&update.number).cloned())
                .unwrap_or_else(|| EntityState::new(update.number));
            state.apply(update);
            self.entities.insert(update.number, state);
        }
        self.snapshots += 1;
    }

    fn push_print(&mut self, level: PrintLevel, text: &str) {
        if self.prints.len() == PRINT_LOG_CAPACITY {
            self.prints.pop_front();
        }
        self.prints.push_back((level, text.to_owned()));
    }
}

impl World for GameState {
    fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::ServerData(data) => self.apply_server_data(data),
            ServerMessage::ConfigString { index, text } => {
                self.config_strings.insert(*index, text.clone());
            },
            ServerMessage::SpawnBaseline(delta) => {
                self.baselines
                    .entry(delta.number)
                    .or_insert_with(|| EntityState::new(delta.number))
                    .apply(delta);
            },
            ServerMessage::Frame(header) => self.frame = Some(header.server_frame),
            ServerMessage::PlayerInfo(delta) => self.player.apply(delta),
            ServerMessage::PacketEntities { delta, entities } => {
                self.apply_packet_entities(*delta, entities);
            },
            ServerMessage::Print { level, text } => self.push_print(*level, text),
            ServerMessage::CenterPrint(text) => self.center_print = Some(text.clone()),
            ServerMessage::Inventory(items) => self.inventory = Some(items.clone()),
            ServerMessage::Layout(text) => self.layout = Some(text.clone()),
            ServerMessage::Bad { .. } => self.bad_messages += 1,
            ServerMessage::MuzzleFlash { .. }
            | ServerMessage::MuzzleFlash2 { .. }
            | ServerMessage::Nop
            | ServerMessage::Disconnect
            | ServerMessage::Reconnect
            | ServerMessage::Sound(_)
            | ServerMessage::StuffText(_)
            | ServerMessage::Download { .. } => {},
        }
    }

    fn current_frame_number(&self) -> Option<i32> {
        self.frame
    }

    fn is_spawned(&self) -> bool {
        self.controlled_entity().is_some() && self.player.is_alive()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::FrameHeader;

    fn server_data(player_num: i16) -> ServerMessage {
        ServerMessage::ServerData(ServerData {
            protocol: 34,
            server_count: 1,
            player_num,
            level_name: "The Edge".to_owned(),
            ..ServerData::default()
        })
    }

    fn entity(number: u16, x: f32) -> EntityDelta {
        EntityDelta {
            number,
            origin: [Some(x), Some(0.0), None],
            ..EntityDelta::default()
        }
    }

    fn snapshot(delta: bool, entities: Vec<EntityDelta>) -> ServerMessage {
        ServerMessage::PacketEntities { delta, entities }
    }

    #[test]
    fn spawned_once_controlled_entity_appears() {
        let mut world = GameState::new();
        world.apply(&server_data(0));
        assert!(!world.is_spawned());
        world.apply(&snapshot(false, vec![entity(1, 10.0), entity(5, 0.0)]));
        assert!(world.is_spawned());
        assert_eq!(world.controlled_entity().unwrap().origin[0], 10.0);
    }

    #[test]
    fn dead_player_is_not_spawned() {
        let mut world = GameState::new();
        world.apply(&server_data(2));
        world.apply(&snapshot(false, vec![entity(3, 0.0)]));
        world.apply(&ServerMessage::PlayerInfo(PlayerStateDelta {
            move_type: Some(MoveType::Dead),
            ..PlayerStateDelta::default()
        }));
        assert!(!world.is_spawned());
        world.apply(&ServerMessage::PlayerInfo(PlayerStateDelta {
            move_type: Some(MoveType::Normal),
            ..PlayerStateDelta::default()
        }));
        assert!(world.is_spawned());
    }

    #[test]
    fn frame_header_sets_frame_number() {
        let mut world = GameState::new();
        assert_eq!(world.current_frame_number(), None);
        world.apply(&ServerMessage::Frame(FrameHeader {
            server_frame: 77,
            delta_frame: -1,
            ..FrameHeader::default()
        }));
        assert_eq!(world.current_frame_number(), Some(77));
    }

    #[test]
    fn delta_snapshot_keeps_unmentioned_entities() {
        let mut world = GameState::new();
        world.apply(&snapshot(false, vec![entity(1, 1.0), entity(2, 2.0)]));
        world.apply(&snapshot(true, vec![entity(2, 20.0)]));
        assert_eq!(world.entity(1).unwrap().origin[0], 1.0);
        assert_eq!(world.entity(2).unwrap().origin[0], 20.0);

        let removal = EntityDelta {
            number: 1,
            remove: true,
            ..EntityDelta::default()
        };
        world.apply(&snapshot(true, vec![removal]));
        assert!(world.entity(1).is_none());

        world.apply(&snapshot(false, vec![entity(3, 3.0)]));
        assert_eq!(world.entities().keys().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(world.snapshot_count(), 4);
    }

    #[test]
    fn new_entities_start_from_baseline() {
        let mut world = GameState::new();
        world.apply(&ServerMessage::SpawnBaseline(EntityDelta {
            number: 9,
            model_index: [Some(4), None, None, None],
            origin: [Some(1.0), Some(2.0), Some(3.0)],
            ..EntityDelta::default()
        }));
        world.apply(&snapshot(false, vec![entity(9, 50.0)]));
        let state = world.entity(9).unwrap();
        assert_eq!(state.model_index[0], 4);
        assert_eq!(state.origin, [50.0, 0.0, 3.0]);
    }

    #[test]
    fn server_data_resets_level_state() {
        let mut world = GameState::new();
        world.apply(&server_data(0));
        world.apply(&ServerMessage::ConfigString {
            index: CS_MODELS + 1,
            text: "maps/q2dm1.bsp".to_owned(),
        });
        world.apply(&snapshot(false, vec![entity(1, 0.0)]));
        world.apply(&ServerMessage::Print {
            level: PrintLevel::High,
            text: "changing level".to_owned(),
        });
        assert_eq!(world.map_name(), Some("maps/q2dm1.bsp"));

        world.apply(&server_data(1));
        assert_eq!(world.map_name(), None);
        assert!(world.entities().is_empty());
        assert_eq!(world.controlled_entity_number(), Some(2));
        assert_eq!(world.prints().count(), 1);
    }

    #[test]
    fn print_log_is_bounded() {
        let mut world = GameState::new();
        for i in 0..100 {
            world.apply(&ServerMessage::Print {
                level: PrintLevel::Low,
                text: i.to_string(),
            });
        }
        assert_eq!(world.prints().count(), PRINT_LOG_CAPACITY);
        assert_eq!(world.prints().next().unwrap().1, "36");
    }

    #[test]
    fn player_stats_update() {
        let mut world = GameState::new();
        world.apply(&ServerMessage::PlayerInfo(PlayerStateDelta {
            stats: vec![(1, 100), (200, 5)],
            fov: Some(110),
            ..PlayerStateDelta::default()
        }));
        assert_eq!(world.player().stats[1], 100);
        assert_eq!(world.player().fov, 110);
    }

    #[test]
    fn reapplying_a_reliable_message_is_harmless() {
        let mut world = GameState::new();
        let message = ServerMessage::ConfigString {
            index: 5,
            text: "x".to_owned(),
        };
        world.apply(&message);
        world.apply(&message);
        assert_eq!(world.config_string(5), Some("x"));
    }

    #[test]
    fn closures_are_observers() {
        let seen = std::sync::atomic::AtomicI32::new(0);
        let observer = |world: &GameState| {
            seen.store(
                world.current_frame_number().unwrap_or(-1),
                std::sync::atomic::Ordering::SeqCst,
            );
        };
        let mut world = GameState::new();
        world.apply(&ServerMessage::Frame(FrameHeader {
            server_frame: 3,
            ..FrameHeader::default()
        }));
        WorldObserver::on_world_update(&observer, &world);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
