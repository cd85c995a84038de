//! Back (server-facing) packet model.
//!
//! Body: VarInt packet id then fields. Strings are VarInt-prefixed UTF-8,
//! numbers big-endian, UUIDs 128-bit.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::{DecodeError, Reader};
use crate::network::put_varint;

/// Connection phase on the back leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackState {
    Handshake,
    Login,
    Play,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

/// `next_state` value for a login intention
pub const INTENTION_LOGIN: i32 = 2;

mod ids {
    pub const CLIENT_INTENTION: i32 = 0x00;
    pub const LOGIN_START: i32 = 0x00;

    pub const LOGIN_DISCONNECT: i32 = 0x00;
    pub const ENCRYPTION_REQUEST: i32 = 0x01;
    pub const LOGIN_SUCCESS: i32 = 0x02;

    pub const PLAY_DISCONNECT: i32 = 0x1A;
    pub const KEEP_ALIVE: i32 = 0x23;
    pub const INITIALIZE_BORDER: i32 = 0x22;
    pub const JOIN_GAME: i32 = 0x28;
    pub const PLAYER_POSITION: i32 = 0x3C;
    pub const REMOVE_MOB_EFFECT: i32 = 0x3F;
    pub const UPDATE_MOB_EFFECT: i32 = 0x6C;
    pub const RESPAWN: i32 = 0x41;
    pub const SYSTEM_CHAT: i32 = 0x64;

    pub const KEEP_ALIVE_RESPONSE: i32 = 0x12;
    pub const MOVE_PLAYER_POS: i32 = 0x14;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackPacket {
    // serverbound
    ClientIntention {
        protocol_version: i32,
        host: String,
        port: u16,
        next_state: i32,
    },
    LoginStart {
        name: String,
        uuid: Uuid,
    },
    KeepAliveResponse {
        id: i64,
    },
    MovePlayerPos {
        x: f64,
        y: f64,
        z: f64,
        on_ground: bool,
    },

    // clientbound
    LoginDisconnect {
        reason: String,
    },
    EncryptionRequest {
        server_id: String,
        public_key: Vec<u8>,
        verify_token: Vec<u8>,
    },
    LoginSuccess {
        uuid: Uuid,
        name: String,
    },
    JoinGame {
        entity_id: i32,
        dimension: String,
        game_mode: u8,
    },
    Respawn {
        dimension: String,
    },
    KeepAlive {
        id: i64,
    },
    Disconnect {
        reason: String,
    },
    SystemChat {
        message: String,
        overlay: bool,
    },
    PlayerPosition {
        x: f64,
        y: f64,
        z: f64,
        yaw: f32,
        pitch: f32,
        teleport_id: i32,
    },
    UpdateMobEffect {
        entity_id: i32,
        effect_id: i32,
        amplifier: u8,
        duration: i32,
    },
    RemoveMobEffect {
        entity_id: i32,
        effect_id: i32,
    },
    /// Border centre and a diameter change over `speed_ms`
    InitializeBorder {
        center_x: f64,
        center_z: f64,
        old_diameter: f64,
        new_diameter: f64,
        speed_ms: i32,
    },

    Opaque {
        id: i32,
        body: Bytes,
    },
}

impl BackPacket {
    fn id(&self) -> i32 {
        use BackPacket::*;
        match self {
            ClientIntention { .. } => ids::CLIENT_INTENTION,
            LoginStart { .. } => ids::LOGIN_START,
            KeepAliveResponse { .. } => ids::KEEP_ALIVE_RESPONSE,
            MovePlayerPos { .. } => ids::MOVE_PLAYER_POS,
            LoginDisconnect { .. } => ids::LOGIN_DISCONNECT,
            EncryptionRequest { .. } => ids::ENCRYPTION_REQUEST,
            LoginSuccess { .. } => ids::LOGIN_SUCCESS,
            JoinGame { .. } => ids::JOIN_GAME,
            Respawn { .. } => ids::RESPAWN,
            KeepAlive { .. } => ids::KEEP_ALIVE,
            Disconnect { .. } => ids::PLAY_DISCONNECT,
            SystemChat { .. } => ids::SYSTEM_CHAT,
            PlayerPosition { .. } => ids::PLAYER_POSITION,
            InitializeBorder { .. } => ids::INITIALIZE_BORDER,
            UpdateMobEffect { .. } => ids::UPDATE_MOB_EFFECT,
            RemoveMobEffect { .. } => ids::REMOVE_MOB_EFFECT,
            Opaque { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        use BackPacket::*;
        match self {
            ClientIntention { .. } => "ClientIntention",
            LoginStart { .. } => "LoginStart",
            KeepAliveResponse { .. } => "KeepAliveResponse",
            MovePlayerPos { .. } => "MovePlayerPos",
            LoginDisconnect { .. } => "LoginDisconnect",
            EncryptionRequest { .. } => "EncryptionRequest",
            LoginSuccess { .. } => "LoginSuccess",
            JoinGame { .. } => "JoinGame",
            Respawn { .. } => "Respawn",
            KeepAlive { .. } => "KeepAlive",
            Disconnect { .. } => "Disconnect",
            SystemChat { .. } => "SystemChat",
            PlayerPosition { .. } => "PlayerPosition",
            InitializeBorder { .. } => "InitializeBorder",
            UpdateMobEffect { .. } => "UpdateMobEffect",
            RemoveMobEffect { .. } => "RemoveMobEffect",
            Opaque { .. } => "Opaque",
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_varint(buf, s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    put_varint(buf, b.len() as i32);
    buf.put_slice(b);
}

pub fn encode(packet: &BackPacket) -> Bytes {
    use BackPacket::*;

    let mut buf = BytesMut::with_capacity(32);
    put_varint(&mut buf, packet.id());

    match packet {
        ClientIntention {
            protocol_version,
            host,
            port,
            next_state,
        } => {
            put_varint(&mut buf, *protocol_version);
            put_string(&mut buf, host);
            buf.put_u16(*port);
            put_varint(&mut buf, *next_state);
        }
        LoginStart { name, uuid } => {
            put_string(&mut buf, name);
            buf.put_u128(uuid.as_u128());
        }
        KeepAliveResponse { id } | KeepAlive { id } => buf.put_i64(*id),
        MovePlayerPos { x, y, z, on_ground } => {
            buf.put_f64(*x);
            buf.put_f64(*y);
            buf.put_f64(*z);
            buf.put_u8(*on_ground as u8);
        }
        LoginDisconnect { reason } | Disconnect { reason } => put_string(&mut buf, reason),
        EncryptionRequest {
            server_id,
            public_key,
            verify_token,
        } => {
            put_string(&mut buf, server_id);
            put_blob(&mut buf, public_key);
            put_blob(&mut buf, verify_token);
        }
        LoginSuccess { uuid, name } => {
            buf.put_u128(uuid.as_u128());
            put_string(&mut buf, name);
        }
        JoinGame {
            entity_id,
            dimension,
            game_mode,
        } => {
            buf.put_i32(*entity_id);
            put_string(&mut buf, dimension);
            buf.put_u8(*game_mode);
        }
        Respawn { dimension } => put_string(&mut buf, dimension),
        SystemChat { message, overlay } => {
            put_string(&mut buf, message);
            buf.put_u8(*overlay as u8);
        }
        PlayerPosition {
            x,
            y,
            z,
            yaw,
            pitch,
            teleport_id,
        } => {
            buf.put_f64(*x);
            buf.put_f64(*y);
            buf.put_f64(*z);
            buf.put_f32(*yaw);
            buf.put_f32(*pitch);
            put_varint(&mut buf, *teleport_id);
        }
        InitializeBorder {
            center_x,
            center_z,
            old_diameter,
            new_diameter,
            speed_ms,
        } => {
            buf.put_f64(*center_x);
            buf.put_f64(*center_z);
            buf.put_f64(*old_diameter);
            buf.put_f64(*new_diameter);
            put_varint(&mut buf, *speed_ms);
        }
        UpdateMobEffect {
            entity_id,
            effect_id,
            amplifier,
            duration,
        } => {
            put_varint(&mut buf, *entity_id);
            put_varint(&mut buf, *effect_id);
            buf.put_u8(*amplifier);
            put_varint(&mut buf, *duration);
        }
        RemoveMobEffect { entity_id, effect_id } => {
            put_varint(&mut buf, *entity_id);
            put_varint(&mut buf, *effect_id);
        }
        Opaque { body, .. } => buf.put_slice(body),
    }

    buf.freeze()
}

fn read_uuid(r: &mut Reader<'_>) -> Result<Uuid, DecodeError> {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(r.take(16)?);
    Ok(Uuid::from_bytes(raw))
}

/// Decode a body for the given phase and direction. Ids without a model
/// come back as `Opaque`.
pub fn decode(state: BackState, direction: Direction, body: &[u8]) -> Result<BackPacket, DecodeError> {
    let mut r = Reader::new(body);
    let id = r.varint()?;

    let packet = match (state, direction, id) {
        (BackState::Handshake, Direction::Serverbound, ids::CLIENT_INTENTION) => BackPacket::ClientIntention {
            protocol_version: r.varint()?,
            host: r.var_string()?,
            port: r.u16()?,
            next_state: r.varint()?,
        },
        (BackState::Login, Direction::Serverbound, ids::LOGIN_START) => BackPacket::LoginStart {
            name: r.var_string()?,
            uuid: read_uuid(&mut r)?,
        },
        (BackState::Login, Direction::Clientbound, ids::LOGIN_DISCONNECT) => BackPacket::LoginDisconnect {
            reason: r.var_string()?,
        },
        (BackState::Login, Direction::Clientbound, ids::ENCRYPTION_REQUEST) => BackPacket::EncryptionRequest {
            server_id: r.var_string()?,
            public_key: r.var_blob()?.to_vec(),
            verify_token: r.var_blob()?.to_vec(),
        },
        (BackState::Login, Direction::Clientbound, ids::LOGIN_SUCCESS) => BackPacket::LoginSuccess {
            uuid: read_uuid(&mut r)?,
            name: r.var_string()?,
        },
        (BackState::Play, Direction::Clientbound, ids::PLAY_DISCONNECT) => BackPacket::Disconnect {
            reason: r.var_string()?,
        },
        (BackState::Play, Direction::Clientbound, ids::KEEP_ALIVE) => BackPacket::KeepAlive { id: r.i64()? },
        (BackState::Play, Direction::Clientbound, ids::JOIN_GAME) => BackPacket::JoinGame {
            entity_id: r.i32()?,
            dimension: r.var_string()?,
            game_mode: r.u8()?,
        },
        (BackState::Play, Direction::Clientbound, ids::PLAYER_POSITION) => BackPacket::PlayerPosition {
            x: r.f64()?,
            y: r.f64()?,
            z: r.f64()?,
            yaw: r.f32()?,
            pitch: r.f32()?,
            teleport_id: r.varint()?,
        },
        (BackState::Play, Direction::Clientbound, ids::INITIALIZE_BORDER) => BackPacket::InitializeBorder {
            center_x: r.f64()?,
            center_z: r.f64()?,
            old_diameter: r.f64()?,
            new_diameter: r.f64()?,
            speed_ms: r.varint()?,
        },
        (BackState::Play, Direction::Clientbound, ids::UPDATE_MOB_EFFECT) => BackPacket::UpdateMobEffect {
            entity_id: r.varint()?,
            effect_id: r.varint()?,
            amplifier: r.u8()?,
            duration: r.varint()?,
        },
        (BackState::Play, Direction::Clientbound, ids::REMOVE_MOB_EFFECT) => BackPacket::RemoveMobEffect {
            entity_id: r.varint()?,
            effect_id: r.varint()?,
        },
        (BackState::Play, Direction::Clientbound, ids::RESPAWN) => BackPacket::Respawn {
            dimension: r.var_string()?,
        },
        (BackState::Play, Direction::Clientbound, ids::SYSTEM_CHAT) => BackPacket::SystemChat {
            message: r.var_string()?,
            overlay: r.bool()?,
        },
        (BackState::Play, Direction::Serverbound, ids::KEEP_ALIVE_RESPONSE) => {
            BackPacket::KeepAliveResponse { id: r.i64()? }
        }
        (BackState::Play, Direction::Serverbound, ids::MOVE_PLAYER_POS) => BackPacket::MovePlayerPos {
            x: r.f64()?,
            y: r.f64()?,
            z: r.f64()?,
            on_ground: r.bool()?,
        },
        (BackState::Handshake, _, _) => return Err(DecodeError::UnexpectedPacket(id as u16)),
        _ => BackPacket::Opaque {
            id,
            body: Bytes::copy_from_slice(r.rest()),
        },
    };

    Ok(packet)
}
