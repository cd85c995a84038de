//! Tick Scheduler work.
//!
//! `run_session` fires `Session::run_tick` every `TICK_INTERVAL` from the
//! session's own loop, so a tick never overlaps a packet handler.

use std::time::{Duration, Instant};

use super::Session;
use crate::protocol::back::BackPacket;

/// Position is re-sent to the backend after this long without movement
pub const POSITION_RESYNC_AFTER: Duration = Duration::from_secs(3);

pub const BASE_SWING_TICKS: i32 = 6;

pub const EFFECT_HASTE: i32 = 3;
pub const EFFECT_MINING_FATIGUE: i32 = 4;
pub const EFFECT_CONDUIT_POWER: i32 = 26;

/// Distance from the border edge at which the warning fog applies
pub const BORDER_WARNING_BLOCKS: f64 = 5.0;
pub const BORDER_FOG: &str = "minecraft:fog_crimson_forest";

const SWING_IDLE: i32 = -1;
const SWING_PENDING: i32 = -2;

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("No backend link for position resync")]
    NoBackend,

    #[error("Backend link closed during position resync")]
    BackendClosed,
}

/// Front effect id for a backend effect registry id.
///
/// Backend ids are zero-based; most front ids are the same list shifted
/// by one. Effects the front has no counterpart for map to `None`.
pub fn front_effect_id(back_id: i32) -> Option<i32> {
    match back_id {
        0..=22 => Some(back_id + 1),
        24 => Some(24),
        27 => Some(27),
        28 => Some(EFFECT_CONDUIT_POWER),
        30 => Some(28),
        31 => Some(29),
        32 => Some(30),
        _ => None,
    }
}

/// Arm-swing length in ticks for the given effect levels.
pub fn swing_duration(haste_level: i32, fatigue_level: i32) -> i32 {
    if haste_level > 0 {
        BASE_SWING_TICKS - haste_level
    } else if fatigue_level > 0 {
        BASE_SWING_TICKS + fatigue_level * 2
    } else {
        BASE_SWING_TICKS
    }
}

/// Backend-driven world border, interpolated once per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldBorder {
    pub center_x: f64,
    pub center_z: f64,
    pub diameter: f64,
    target_diameter: f64,
    step: f64,
    remaining_ticks: u64,
}

impl WorldBorder {
    pub fn new(center_x: f64, center_z: f64, old_diameter: f64, new_diameter: f64, speed_ms: i32) -> Self {
        let ticks = (speed_ms.max(0) as u64) / 50;
        let step = if ticks == 0 {
            0.0
        } else {
            (new_diameter - old_diameter) / ticks as f64
        };
        Self {
            center_x,
            center_z,
            diameter: if ticks == 0 { new_diameter } else { old_diameter },
            target_diameter: new_diameter,
            step,
            remaining_ticks: ticks,
        }
    }

    pub fn is_resizing(&self) -> bool {
        self.remaining_ticks > 0
    }

    pub fn resize(&mut self) {
        if self.remaining_ticks == 0 {
            return;
        }
        self.remaining_ticks -= 1;
        self.diameter = if self.remaining_ticks == 0 {
            self.target_diameter
        } else {
            self.diameter + self.step
        };
    }

    /// Blocks between `(x, z)` and the nearest edge; negative when outside
    pub fn distance_to_edge(&self, x: f64, z: f64) -> f64 {
        let half = self.diameter / 2.0;
        let dx = half - (x - self.center_x).abs();
        let dz = half - (z - self.center_z).abs();
        dx.min(dz)
    }

    pub fn within_warning(&self, x: f64, z: f64) -> bool {
        self.distance_to_edge(x, z) <= BORDER_WARNING_BLOCKS
    }
}

#[derive(Debug)]
pub struct TickState {
    pub enabled: bool,
    pub last_move: Instant,
    /// Ticks into the current swing; -1 idle, -2 swing queued
    pub arm_swing_ticks: i32,
    pub border: Option<WorldBorder>,
    pub in_border_warning: bool,
    pub ticks: u64,
}

impl Default for TickState {
    fn default() -> Self {
        Self {
            enabled: false,
            last_move: Instant::now(),
            arm_swing_ticks: SWING_IDLE,
            border: None,
            in_border_warning: false,
            ticks: 0,
        }
    }
}

impl TickState {
    pub fn activate_arm_swing(&mut self) {
        self.arm_swing_ticks = 0;
    }

    /// Queue a swing; it starts on the next tick.
    pub fn arm_swing_pending(&mut self) {
        if self.arm_swing_ticks == SWING_IDLE {
            self.arm_swing_ticks = SWING_PENDING;
        }
    }

    pub fn is_swinging(&self) -> bool {
        self.arm_swing_ticks >= 0
    }
}

impl Session {
    /// One tick. Faults are logged and the session carries on.
    pub fn run_tick(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.tick_once() {
            tracing::warn!("[tick] [fault] session={} error={}", self.id, e);
        }
    }

    fn tick_once(&mut self) -> Result<(), TickError> {
        self.tick.ticks += 1;

        let resync = self.resync_position();
        self.tick_border();
        self.tick_arm_swing();

        resync
    }

    fn resync_position(&mut self) -> Result<(), TickError> {
        if !self.world.spawned || self.tick.last_move.elapsed() < POSITION_RESYNC_AFTER {
            return Ok(());
        }
        self.tick.last_move = Instant::now();

        let back = self.back.as_ref().ok_or(TickError::NoBackend)?;
        let position = self.world.position;
        back.send(&BackPacket::MovePlayerPos {
            x: position.x as f64,
            y: position.y as f64,
            z: position.z as f64,
            on_ground: self.world.on_ground,
        })
        .map_err(|_| TickError::BackendClosed)
    }

    fn tick_border(&mut self) {
        let Some(border) = self.tick.border.as_mut() else {
            return;
        };
        if border.is_resizing() {
            border.resize();
        }

        let position = self.world.position;
        let warn = border.within_warning(position.x as f64, position.z as f64);
        if warn && !self.tick.in_border_warning {
            self.tick.in_border_warning = true;
            self.send_fog(&[BORDER_FOG]);
        } else if !warn && self.tick.in_border_warning {
            self.tick.in_border_warning = false;
            self.remove_fog(&[BORDER_FOG]);
        }
    }

    fn tick_arm_swing(&mut self) {
        if self.tick.arm_swing_ticks == SWING_PENDING {
            self.tick.activate_arm_swing();
        }
        if !self.tick.is_swinging() {
            return;
        }

        // recomputed every tick so effect changes mid-swing apply at once
        let haste = self
            .world
            .effect_level(EFFECT_HASTE)
            .max(self.world.effect_level(EFFECT_CONDUIT_POWER));
        let fatigue = self.world.effect_level(EFFECT_MINING_FATIGUE);
        let duration = swing_duration(haste, fatigue);

        self.tick.arm_swing_ticks += 1;
        if self.tick.arm_swing_ticks >= duration {
            self.tick.arm_swing_ticks = SWING_IDLE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::spawned_session;
    use crate::protocol::front::FrontPacket;

    #[test]
    fn test_swing_duration() {
        assert_eq!(swing_duration(0, 0), 6);
        assert_eq!(swing_duration(2, 0), 4);
        assert_eq!(swing_duration(0, 3), 12);
        // haste wins over fatigue
        assert_eq!(swing_duration(1, 3), 5);
    }

    #[test]
    fn test_front_effect_ids() {
        assert_eq!(front_effect_id(2), Some(EFFECT_HASTE));
        assert_eq!(front_effect_id(3), Some(EFFECT_MINING_FATIGUE));
        assert_eq!(front_effect_id(28), Some(EFFECT_CONDUIT_POWER));
        // glowing has no front counterpart
        assert_eq!(front_effect_id(23), None);
    }

    #[test]
    fn test_border_lerp() {
        let mut border = WorldBorder::new(0.0, 0.0, 100.0, 50.0, 500);
        assert!(border.is_resizing());
        for _ in 0..10 {
            border.resize();
        }
        assert!(!border.is_resizing());
        assert_eq!(border.diameter, 50.0);

        let instant = WorldBorder::new(0.0, 0.0, 100.0, 20.0, 0);
        assert_eq!(instant.diameter, 20.0);
    }

    #[test]
    fn test_border_distance() {
        let border = WorldBorder::new(0.0, 0.0, 20.0, 20.0, 0);
        assert_eq!(border.distance_to_edge(0.0, 0.0), 10.0);
        assert!(!border.within_warning(0.0, 0.0));
        assert!(border.within_warning(6.0, 0.0));
        assert!(border.distance_to_edge(12.0, 0.0) < 0.0);
    }

    #[tokio::test]
    async fn test_swing_recomputed_each_tick() {
        let mut t = spawned_session().await;
        t.session.tick.arm_swing_pending();
        t.session.run_tick();
        // pending -> active -> first tick counted
        assert_eq!(t.session.tick.arm_swing_ticks, 1);

        t.session.run_tick();
        t.session.run_tick();
        assert_eq!(t.session.tick.arm_swing_ticks, 3);

        // haste II arrives mid-swing: duration drops to 4, swing ends next tick
        t.session.world.effects.insert(EFFECT_HASTE, 1);
        t.session.run_tick();
        assert_eq!(t.session.tick.arm_swing_ticks, -1);
    }

    #[tokio::test]
    async fn test_fatigue_lengthens_swing() {
        let mut t = spawned_session().await;
        t.session.world.effects.insert(EFFECT_MINING_FATIGUE, 0);
        t.session.tick.activate_arm_swing();
        for _ in 0..7 {
            t.session.run_tick();
        }
        assert!(t.session.tick.is_swinging());
        t.session.run_tick();
        assert!(!t.session.tick.is_swinging());
    }

    #[tokio::test]
    async fn test_position_resync_after_idle() {
        let mut t = spawned_session().await;
        t.session.tick.last_move = Instant::now() - Duration::from_secs(4);
        t.session.run_tick();
        assert_eq!(
            t.next_back_packet(),
            Some(BackPacket::MovePlayerPos {
                x: 0.0,
                y: 64.0,
                z: 0.0,
                on_ground: true
            })
        );

        // no second resync right away
        t.session.run_tick();
        assert_eq!(t.next_back_packet(), None);
    }

    #[tokio::test]
    async fn test_tick_fault_is_contained() {
        let mut t = spawned_session().await;
        t.drop_backend();
        t.session.tick.last_move = Instant::now() - Duration::from_secs(4);
        t.session.tick.activate_arm_swing();

        t.session.run_tick();

        assert!(!t.session.is_closed());
        // the rest of the tick still ran
        assert_eq!(t.session.tick.arm_swing_ticks, 1);
        t.session.run_tick();
        assert_eq!(t.session.tick.ticks, 2);
    }

    #[tokio::test]
    async fn test_border_fog_toggles() {
        let mut t = spawned_session().await;
        t.session.tick.border = Some(WorldBorder::new(0.0, 0.0, 20.0, 20.0, 0));
        t.session.world.position = crate::protocol::front::Vec3::new(7.0, 64.0, 0.0);
        t.session.run_tick();
        t.session.world.position = crate::protocol::front::Vec3::new(0.0, 64.0, 0.0);
        t.session.run_tick();

        let stacks: Vec<Vec<String>> = t
            .recv_all()
            .into_iter()
            .filter_map(|p| match p {
                FrontPacket::PlayerFog { stack } => Some(stack),
                _ => None,
            })
            .collect();
        assert_eq!(stacks, vec![vec![BORDER_FOG.to_string()], vec![]]);
    }
}
