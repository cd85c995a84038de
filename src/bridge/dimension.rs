//! Dimension Transition Controller
//!
//! Moving a spawned player between worlds takes a fixed sequence of front
//! packets. Position-dependent caches must be empty before any terrain for
//! the destination goes out, and the client needs placeholder terrain
//! around the landing point or it stalls on the loading screen.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};

use super::Session;
use crate::protocol::front::{FrontPacket, Vec3, MOB_EFFECT_REMOVE};

pub const OVERWORLD: &str = "minecraft:overworld";
pub const NETHER: &str = "minecraft:the_nether";
pub const THE_END: &str = "minecraft:the_end";

pub const BEDROCK_OVERWORLD: i32 = 0;
pub const BEDROCK_NETHER: i32 = 1;
pub const BEDROCK_END: i32 = 2;

/// Largest radius the client tolerates while switching worlds
pub const MAX_SWITCH_RENDER_DISTANCE: i32 = 47;

/// Radius of empty chunks sent around the landing point
pub const PLACEHOLDER_RADIUS: i32 = 3;

pub const NETHER_FOG: &str = "minecraft:fog_hell";

/// Neutral landing point used until the backend sends a real position
pub const PLACEHOLDER_POSITION: Vec3 = Vec3::new(0.0, 64.0, 0.0);

/// Map a backend dimension name to the front dimension id.
///
/// With the nether building workaround the nether is presented as the end,
/// which has no build-height cap at 128.
pub fn front_dimension(backend: &str, nether_workaround: bool) -> i32 {
    match backend {
        NETHER if nether_workaround => BEDROCK_END,
        NETHER => BEDROCK_NETHER,
        THE_END => BEDROCK_END,
        _ => BEDROCK_OVERWORLD,
    }
}

/// Everything the client has been told about the current world.
#[derive(Debug, Default)]
pub struct WorldCaches {
    pub chunks: HashSet<(i32, i32)>,
    pub entities: HashSet<u64>,
    pub pistons: HashSet<(i32, i32, i32)>,
    pub lecterns: HashSet<(i32, i32, i32)>,
    pub skulls: HashSet<(i32, i32, i32)>,
}

impl WorldCaches {
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.entities.clear();
        self.pistons.clear();
        self.lecterns.clear();
        self.skulls.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
            && self.entities.is_empty()
            && self.pistons.is_empty()
            && self.lecterns.is_empty()
            && self.skulls.is_empty()
    }

    /// Record terrain the client now holds
    pub fn observe(&mut self, packet: &FrontPacket) {
        if let FrontPacket::LevelChunk { chunk_x, chunk_z, .. } = packet {
            self.chunks.insert((*chunk_x, *chunk_z));
        }
    }
}

/// Per-session view of the player's world.
#[derive(Debug)]
pub struct WorldState {
    /// Backend dimension name
    pub dimension: String,
    pub front_dimension: i32,
    pub render_distance: i32,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub on_ground: bool,
    /// Front runtime id of the player entity
    pub runtime_id: u64,
    /// Backend entity id of the player
    pub entity_id: i32,
    pub spawned: bool,
    pub caches: WorldCaches,
    /// Active status effects: effect id -> amplifier
    pub effects: HashMap<i32, i32>,
    /// Applied fog ids, oldest first
    pub fog: Vec<String>,
    loading_screens: u32,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            dimension: OVERWORLD.to_string(),
            front_dimension: BEDROCK_OVERWORLD,
            render_distance: 0,
            position: PLACEHOLDER_POSITION,
            yaw: 0.0,
            pitch: 0.0,
            on_ground: true,
            runtime_id: 1,
            entity_id: 0,
            spawned: false,
            caches: WorldCaches::default(),
            effects: HashMap::new(),
            fog: Vec::new(),
            loading_screens: 0,
        }
    }
}

impl WorldState {
    /// Amplifier + 1, or 0 when the effect is not active
    pub fn effect_level(&self, effect_id: i32) -> i32 {
        self.effects.get(&effect_id).map(|amp| amp + 1).unwrap_or(0)
    }

    fn next_loading_screen(&mut self) -> u32 {
        self.loading_screens = self.loading_screens.wrapping_add(1);
        self.loading_screens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStep {
    WidenRadius,
    ChangeWorld,
    ClearCaches,
    ClearEffects,
    StopSounds,
    PlaceholderTerrain,
}

/// Steps for a world change, in the order they must run.
pub fn plan_transition(render_distance: i32) -> Vec<TransitionStep> {
    let mut steps = Vec::with_capacity(6);
    if render_distance > MAX_SWITCH_RENDER_DISTANCE {
        steps.push(TransitionStep::WidenRadius);
    }
    steps.extend([
        TransitionStep::ChangeWorld,
        TransitionStep::ClearCaches,
        TransitionStep::ClearEffects,
        TransitionStep::StopSounds,
        TransitionStep::PlaceholderTerrain,
    ]);
    steps
}

/// Empty chunk columns covering `radius` around `center`.
pub fn placeholder_chunks(center: Vec3, radius: i32) -> Vec<FrontPacket> {
    let cx = (center.x.floor() as i32) >> 4;
    let cz = (center.z.floor() as i32) >> 4;
    let mut chunks = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for x in -radius..=radius {
        for z in -radius..=radius {
            chunks.push(FrontPacket::LevelChunk {
                chunk_x: cx + x,
                chunk_z: cz + z,
                sub_chunk_count: 0,
                data: Bytes::new(),
            });
        }
    }
    chunks
}

impl Session {
    /// Move the player into `backend_dimension`.
    pub fn switch_dimension(&mut self, backend_dimension: &str) {
        let nether_workaround = self.ctx.config.bedrock.above_bedrock_nether_building;
        let previous = self.world.front_dimension;
        let target = front_dimension(backend_dimension, nether_workaround);

        tracing::debug!(
            "[dimension] [switch] session={} from={} to={}",
            self.id,
            self.world.dimension,
            backend_dimension
        );

        for step in plan_transition(self.world.render_distance) {
            match step {
                TransitionStep::WidenRadius => {
                    self.send_front(&FrontPacket::ChunkRadiusUpdated {
                        radius: MAX_SWITCH_RENDER_DISTANCE,
                    });
                }
                TransitionStep::ChangeWorld => {
                    let loading_screen_id = match self.front.codec() {
                        Some(codec) if codec.has_loading_screen_id() => Some(self.world.next_loading_screen()),
                        _ => None,
                    };
                    self.send_front(&FrontPacket::ChangeDimension {
                        dimension: target,
                        position: PLACEHOLDER_POSITION,
                        respawn: true,
                        loading_screen_id,
                    });
                    self.world.dimension = backend_dimension.to_string();
                    self.world.front_dimension = target;
                    self.world.position = PLACEHOLDER_POSITION;
                    self.world.spawned = false;
                }
                TransitionStep::ClearCaches => self.world.caches.clear(),
                TransitionStep::ClearEffects => {
                    let mut effects: Vec<i32> = self.world.effects.keys().copied().collect();
                    effects.sort_unstable();
                    for effect_id in effects {
                        self.send_front(&FrontPacket::MobEffect {
                            runtime_id: self.world.runtime_id,
                            event: MOB_EFFECT_REMOVE,
                            effect_id,
                            amplifier: 0,
                            duration: 0,
                        });
                    }
                    // the backend re-sends whatever is still active
                    self.world.effects.clear();
                }
                TransitionStep::StopSounds => {
                    self.send_front(&FrontPacket::StopSound {
                        sound_name: String::new(),
                        stop_all: true,
                    });
                }
                TransitionStep::PlaceholderTerrain => {
                    for chunk in placeholder_chunks(self.world.position, PLACEHOLDER_RADIUS) {
                        self.send_front(&chunk);
                    }
                }
            }
        }

        if nether_workaround {
            if backend_dimension == NETHER {
                self.send_fog(&[NETHER_FOG]);
            } else if previous == BEDROCK_END && self.world.fog.iter().any(|f| f == NETHER_FOG) {
                self.remove_fog(&[NETHER_FOG]);
            }
        }
    }

    /// Push fog ids and resend the whole stack.
    pub fn send_fog(&mut self, ids: &[&str]) {
        for id in ids {
            if !self.world.fog.iter().any(|f| f == id) {
                self.world.fog.push(id.to_string());
            }
        }
        let stack = self.world.fog.clone();
        self.send_front(&FrontPacket::PlayerFog { stack });
    }

    /// Remove fog ids (all of them when `ids` is empty) and resend the stack.
    pub fn remove_fog(&mut self, ids: &[&str]) {
        if ids.is_empty() {
            self.world.fog.clear();
        } else {
            self.world.fog.retain(|f| !ids.contains(&f.as_str()));
        }
        let stack = self.world.fog.clone();
        self.send_front(&FrontPacket::PlayerFog { stack });
    }
}
