//! Front (client-facing) packet model.
//!
//! Packet body: `u16 BE` id followed by fields. Integers are big-endian,
//! strings and blobs carry a `u32 BE` length, lists a `u16 BE` count.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{bootstrap_kind, wire_id, CodecDescriptor, PacketKind};
use super::{DecodeError, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStatusKind {
    LoginSuccess,
    FailedClient,
    FailedServer,
    PlayerSpawn,
}

impl PlayStatusKind {
    fn to_wire(self) -> u32 {
        match self {
            PlayStatusKind::LoginSuccess => 0,
            PlayStatusKind::FailedClient => 1,
            PlayStatusKind::FailedServer => 2,
            PlayStatusKind::PlayerSpawn => 3,
        }
    }

    fn from_wire(v: u32) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => PlayStatusKind::LoginSuccess,
            1 => PlayStatusKind::FailedClient,
            2 => PlayStatusKind::FailedServer,
            3 => PlayStatusKind::PlayerSpawn,
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "play status",
                    value: other as i64,
                })
            }
        })
    }
}

/// Client reply to the pack offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackResponseStatus {
    Refused,
    SendPacks,
    HaveAllPacks,
    Completed,
    Other(u8),
}

impl PackResponseStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            PackResponseStatus::Refused => 1,
            PackResponseStatus::SendPacks => 2,
            PackResponseStatus::HaveAllPacks => 3,
            PackResponseStatus::Completed => 4,
            PackResponseStatus::Other(v) => v,
        }
    }

    pub fn from_wire(v: u8) -> Self {
        match v {
            1 => PackResponseStatus::Refused,
            2 => PackResponseStatus::SendPacks,
            3 => PackResponseStatus::HaveAllPacks,
            4 => PackResponseStatus::Completed,
            other => PackResponseStatus::Other(other),
        }
    }
}

pub const MOB_EFFECT_ADD: u8 = 1;
pub const MOB_EFFECT_MODIFY: u8 = 2;
pub const MOB_EFFECT_REMOVE: u8 = 3;

pub const TITLE_ACTIONBAR: i32 = 4;

pub const TEXT_RAW: u8 = 0;
pub const TEXT_CHAT: u8 = 1;
pub const TEXT_SYSTEM: u8 = 6;

pub const ANIMATE_SWING_ARM: i32 = 1;

pub const MOVE_MODE_NORMAL: u8 = 0;
pub const MOVE_MODE_TELEPORT: u8 = 2;

/// One entry of the pack offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInfoEntry {
    pub id: String,
    pub version: String,
    pub size: u64,
    pub content_key: String,
    pub sub_pack_id: String,
}

/// One entry of the pack stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackStackEntry {
    pub id: String,
    pub version: String,
    pub sub_pack_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrontPacket {
    RequestNetworkSettings {
        protocol_version: u32,
    },
    NetworkSettings {
        compression_threshold: u16,
        compression_algorithm: u16,
    },
    Login {
        protocol_version: u32,
        /// JSON object `{"chain": [token, ...]}`
        chain_data: String,
        client_data: String,
    },
    PlayStatus {
        status: PlayStatusKind,
    },
    ServerToClientHandshake {
        token: String,
    },
    ClientToServerHandshake,
    Disconnect {
        hide_screen: bool,
        message: String,
    },
    ResourcePacksInfo {
        forced: bool,
        forcing_server_packs: bool,
        behavior_packs: Vec<PackInfoEntry>,
        resource_packs: Vec<PackInfoEntry>,
    },
    ResourcePackStack {
        forced: bool,
        behavior_packs: Vec<PackStackEntry>,
        resource_packs: Vec<PackStackEntry>,
        game_version: String,
    },
    ResourcePackClientResponse {
        status: PackResponseStatus,
        pack_ids: Vec<String>,
    },
    Text {
        kind: u8,
        source: String,
        message: String,
    },
    StartGame {
        entity_id: i64,
        runtime_id: u64,
        dimension: i32,
        position: Vec3,
        world_name: String,
        game_version: String,
    },
    MovePlayer {
        runtime_id: u64,
        position: Vec3,
        pitch: f32,
        yaw: f32,
        mode: u8,
        on_ground: bool,
    },
    MobEffect {
        runtime_id: u64,
        event: u8,
        effect_id: i32,
        amplifier: i32,
        duration: i32,
    },
    Animate {
        action: i32,
        runtime_id: u64,
    },
    LevelChunk {
        chunk_x: i32,
        chunk_z: i32,
        sub_chunk_count: u32,
        data: Bytes,
    },
    ChangeDimension {
        dimension: i32,
        position: Vec3,
        respawn: bool,
        loading_screen_id: Option<u32>,
    },
    RequestChunkRadius {
        radius: i32,
    },
    ChunkRadiusUpdated {
        radius: i32,
    },
    ResourcePackDataInfo {
        pack_id: String,
        max_chunk_size: u32,
        chunk_count: u32,
        size: u64,
        hash: Vec<u8>,
        premium: bool,
        pack_type: u8,
    },
    ResourcePackChunkData {
        pack_id: String,
        chunk_index: u32,
        progress: u64,
        data: Bytes,
    },
    ResourcePackChunkRequest {
        pack_id: String,
        chunk_index: u32,
    },
    StopSound {
        sound_name: String,
        stop_all: bool,
    },
    SetTitle {
        kind: i32,
        text: String,
    },
    ModalFormRequest {
        form_id: u32,
        form_data: String,
    },
    ModalFormResponse {
        form_id: u32,
        response: Option<String>,
    },
    SetLocalPlayerAsInitialized {
        runtime_id: u64,
    },
    NetworkStackLatency {
        timestamp: i64,
        from_server: bool,
    },
    EmoteList {
        runtime_id: u64,
        piece_ids: Vec<String>,
    },
    PlayerFog {
        stack: Vec<String>,
    },
    /// Anything without a structured model; left to the translator
    Opaque {
        id: u16,
        body: Bytes,
    },
}

impl FrontPacket {
    pub fn kind(&self) -> Option<PacketKind> {
        use FrontPacket::*;
        Some(match self {
            RequestNetworkSettings { .. } => PacketKind::RequestNetworkSettings,
            NetworkSettings { .. } => PacketKind::NetworkSettings,
            Login { .. } => PacketKind::Login,
            PlayStatus { .. } => PacketKind::PlayStatus,
            ServerToClientHandshake { .. } => PacketKind::ServerToClientHandshake,
            ClientToServerHandshake => PacketKind::ClientToServerHandshake,
            Disconnect { .. } => PacketKind::Disconnect,
            ResourcePacksInfo { .. } => PacketKind::ResourcePacksInfo,
            ResourcePackStack { .. } => PacketKind::ResourcePackStack,
            ResourcePackClientResponse { .. } => PacketKind::ResourcePackClientResponse,
            Text { .. } => PacketKind::Text,
            StartGame { .. } => PacketKind::StartGame,
            MovePlayer { .. } => PacketKind::MovePlayer,
            MobEffect { .. } => PacketKind::MobEffect,
            Animate { .. } => PacketKind::Animate,
            LevelChunk { .. } => PacketKind::LevelChunk,
            ChangeDimension { .. } => PacketKind::ChangeDimension,
            RequestChunkRadius { .. } => PacketKind::RequestChunkRadius,
            ChunkRadiusUpdated { .. } => PacketKind::ChunkRadiusUpdated,
            ResourcePackDataInfo { .. } => PacketKind::ResourcePackDataInfo,
            ResourcePackChunkData { .. } => PacketKind::ResourcePackChunkData,
            ResourcePackChunkRequest { .. } => PacketKind::ResourcePackChunkRequest,
            StopSound { .. } => PacketKind::StopSound,
            SetTitle { .. } => PacketKind::SetTitle,
            ModalFormRequest { .. } => PacketKind::ModalFormRequest,
            ModalFormResponse { .. } => PacketKind::ModalFormResponse,
            SetLocalPlayerAsInitialized { .. } => PacketKind::SetLocalPlayerAsInitialized,
            NetworkStackLatency { .. } => PacketKind::NetworkStackLatency,
            EmoteList { .. } => PacketKind::EmoteList,
            PlayerFog { .. } => PacketKind::PlayerFog,
            Opaque { .. } => return None,
        })
    }

    /// Short name for log lines
    pub fn name(&self) -> String {
        match self.kind() {
            Some(kind) => format!("{:?}", kind),
            None => match self {
                FrontPacket::Opaque { id, .. } => format!("Opaque({:#06x})", id),
                _ => "Unknown".to_string(),
            },
        }
    }
}

// ============================================
// Encoding
// ============================================

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

fn put_bool(buf: &mut BytesMut, b: bool) {
    buf.put_u8(b as u8);
}

fn put_vec3(buf: &mut BytesMut, v: &Vec3) {
    buf.put_f32(v.x);
    buf.put_f32(v.y);
    buf.put_f32(v.z);
}

fn put_list<T>(buf: &mut BytesMut, items: &[T], mut each: impl FnMut(&mut BytesMut, &T)) {
    buf.put_u16(items.len() as u16);
    for item in items {
        each(buf, item);
    }
}

fn put_info_entry(buf: &mut BytesMut, e: &PackInfoEntry) {
    put_string(buf, &e.id);
    put_string(buf, &e.version);
    buf.put_u64(e.size);
    put_string(buf, &e.content_key);
    put_string(buf, &e.sub_pack_id);
}

fn put_stack_entry(buf: &mut BytesMut, e: &PackStackEntry) {
    put_string(buf, &e.id);
    put_string(buf, &e.version);
    put_string(buf, &e.sub_pack_name);
}

/// Encode a packet for the given codec (or the bootstrap layout when none
/// is bound yet).
pub fn encode(codec: Option<&CodecDescriptor>, packet: &FrontPacket) -> Bytes {
    use FrontPacket::*;

    let mut buf = BytesMut::with_capacity(64);
    let id = match packet {
        Opaque { id, .. } => *id,
        other => other.kind().map(wire_id).unwrap_or(0),
    };
    buf.put_u16(id);

    match packet {
        RequestNetworkSettings { protocol_version } => buf.put_u32(*protocol_version),
        NetworkSettings {
            compression_threshold,
            compression_algorithm,
        } => {
            buf.put_u16(*compression_threshold);
            buf.put_u16(*compression_algorithm);
        }
        Login {
            protocol_version,
            chain_data,
            client_data,
        } => {
            buf.put_u32(*protocol_version);
            put_string(&mut buf, chain_data);
            put_string(&mut buf, client_data);
        }
        PlayStatus { status } => buf.put_u32(status.to_wire()),
        ServerToClientHandshake { token } => put_string(&mut buf, token),
        ClientToServerHandshake => {}
        Disconnect {
            hide_screen,
            message,
        } => {
            put_bool(&mut buf, *hide_screen);
            put_string(&mut buf, message);
        }
        ResourcePacksInfo {
            forced,
            forcing_server_packs,
            behavior_packs,
            resource_packs,
        } => {
            put_bool(&mut buf, *forced);
            if codec.map_or(true, |c| c.pack_info_has_forcing_flag()) {
                put_bool(&mut buf, *forcing_server_packs);
            }
            put_list(&mut buf, behavior_packs, put_info_entry);
            put_list(&mut buf, resource_packs, put_info_entry);
        }
        ResourcePackStack {
            forced,
            behavior_packs,
            resource_packs,
            game_version,
        } => {
            put_bool(&mut buf, *forced);
            put_list(&mut buf, behavior_packs, put_stack_entry);
            put_list(&mut buf, resource_packs, put_stack_entry);
            put_string(&mut buf, game_version);
        }
        ResourcePackClientResponse { status, pack_ids } => {
            buf.put_u8(status.to_wire());
            put_list(&mut buf, pack_ids, |b, s| put_string(b, s));
        }
        Text {
            kind,
            source,
            message,
        } => {
            buf.put_u8(*kind);
            put_string(&mut buf, source);
            put_string(&mut buf, message);
        }
        StartGame {
            entity_id,
            runtime_id,
            dimension,
            position,
            world_name,
            game_version,
        } => {
            buf.put_i64(*entity_id);
            buf.put_u64(*runtime_id);
            buf.put_i32(*dimension);
            put_vec3(&mut buf, position);
            put_string(&mut buf, world_name);
            put_string(&mut buf, game_version);
        }
        MovePlayer {
            runtime_id,
            position,
            pitch,
            yaw,
            mode,
            on_ground,
        } => {
            buf.put_u64(*runtime_id);
            put_vec3(&mut buf, position);
            buf.put_f32(*pitch);
            buf.put_f32(*yaw);
            buf.put_u8(*mode);
            put_bool(&mut buf, *on_ground);
        }
        MobEffect {
            runtime_id,
            event,
            effect_id,
            amplifier,
            duration,
        } => {
            buf.put_u64(*runtime_id);
            buf.put_u8(*event);
            buf.put_i32(*effect_id);
            buf.put_i32(*amplifier);
            buf.put_i32(*duration);
        }
        Animate { action, runtime_id } => {
            buf.put_i32(*action);
            buf.put_u64(*runtime_id);
        }
        LevelChunk {
            chunk_x,
            chunk_z,
            sub_chunk_count,
            data,
        } => {
            buf.put_i32(*chunk_x);
            buf.put_i32(*chunk_z);
            buf.put_u32(*sub_chunk_count);
            put_blob(&mut buf, data);
        }
        ChangeDimension {
            dimension,
            position,
            respawn,
            loading_screen_id,
        } => {
            buf.put_i32(*dimension);
            put_vec3(&mut buf, position);
            put_bool(&mut buf, *respawn);
            if codec.map_or(false, |c| c.has_loading_screen_id()) {
                match loading_screen_id {
                    Some(id) => {
                        put_bool(&mut buf, true);
                        buf.put_u32(*id);
                    }
                    None => put_bool(&mut buf, false),
                }
            }
        }
        RequestChunkRadius { radius } | ChunkRadiusUpdated { radius } => buf.put_i32(*radius),
        ResourcePackDataInfo {
            pack_id,
            max_chunk_size,
            chunk_count,
            size,
            hash,
            premium,
            pack_type,
        } => {
            put_string(&mut buf, pack_id);
            buf.put_u32(*max_chunk_size);
            buf.put_u32(*chunk_count);
            buf.put_u64(*size);
            put_blob(&mut buf, hash);
            put_bool(&mut buf, *premium);
            buf.put_u8(*pack_type);
        }
        ResourcePackChunkData {
            pack_id,
            chunk_index,
            progress,
            data,
        } => {
            put_string(&mut buf, pack_id);
            buf.put_u32(*chunk_index);
            buf.put_u64(*progress);
            put_blob(&mut buf, data);
        }
        ResourcePackChunkRequest {
            pack_id,
            chunk_index,
        } => {
            put_string(&mut buf, pack_id);
            buf.put_u32(*chunk_index);
        }
        StopSound {
            sound_name,
            stop_all,
        } => {
            put_string(&mut buf, sound_name);
            put_bool(&mut buf, *stop_all);
        }
        SetTitle { kind, text } => {
            buf.put_i32(*kind);
            put_string(&mut buf, text);
        }
        ModalFormRequest { form_id, form_data } => {
            buf.put_u32(*form_id);
            put_string(&mut buf, form_data);
        }
        ModalFormResponse { form_id, response } => {
            buf.put_u32(*form_id);
            match response {
                Some(data) => {
                    put_bool(&mut buf, true);
                    put_string(&mut buf, data);
                }
                None => put_bool(&mut buf, false),
            }
        }
        SetLocalPlayerAsInitialized { runtime_id } => buf.put_u64(*runtime_id),
        NetworkStackLatency {
            timestamp,
            from_server,
        } => {
            buf.put_i64(*timestamp);
            put_bool(&mut buf, *from_server);
        }
        EmoteList {
            runtime_id,
            piece_ids,
        } => {
            buf.put_u64(*runtime_id);
            put_list(&mut buf, piece_ids, |b, s| put_string(b, s));
        }
        PlayerFog { stack } => put_list(&mut buf, stack, |b, s| put_string(b, s)),
        Opaque { body, .. } => buf.put_slice(body),
    }

    buf.freeze()
}

// ============================================
// Decoding
// ============================================

fn read_vec3(r: &mut Reader<'_>) -> Result<Vec3, DecodeError> {
    Ok(Vec3 {
        x: r.f32()?,
        y: r.f32()?,
        z: r.f32()?,
    })
}

fn read_info_entry(r: &mut Reader<'_>) -> Result<PackInfoEntry, DecodeError> {
    Ok(PackInfoEntry {
        id: r.string()?,
        version: r.string()?,
        size: r.u64()?,
        content_key: r.string()?,
        sub_pack_id: r.string()?,
    })
}

fn read_stack_entry(r: &mut Reader<'_>) -> Result<PackStackEntry, DecodeError> {
    Ok(PackStackEntry {
        id: r.string()?,
        version: r.string()?,
        sub_pack_name: r.string()?,
    })
}

/// Decode a packet body.
///
/// With no codec bound only the negotiation packets are accepted. With a
/// codec bound, ids outside its table come back as `Opaque`.
pub fn decode(codec: Option<&CodecDescriptor>, body: &[u8]) -> Result<FrontPacket, DecodeError> {
    let mut r = Reader::new(body);
    let id = r.u16()?;

    let kind = match codec {
        Some(codec) => match codec.kind_of(id) {
            Some(kind) => kind,
            None => {
                return Ok(FrontPacket::Opaque {
                    id,
                    body: Bytes::copy_from_slice(r.rest()),
                })
            }
        },
        None => bootstrap_kind(id).ok_or(DecodeError::UnexpectedPacket(id))?,
    };

    let packet = match kind {
        PacketKind::RequestNetworkSettings => FrontPacket::RequestNetworkSettings {
            protocol_version: r.u32()?,
        },
        PacketKind::NetworkSettings => FrontPacket::NetworkSettings {
            compression_threshold: r.u16()?,
            compression_algorithm: r.u16()?,
        },
        PacketKind::Login => FrontPacket::Login {
            protocol_version: r.u32()?,
            chain_data: r.string()?,
            client_data: r.string()?,
        },
        PacketKind::PlayStatus => FrontPacket::PlayStatus {
            status: PlayStatusKind::from_wire(r.u32()?)?,
        },
        PacketKind::ServerToClientHandshake => FrontPacket::ServerToClientHandshake {
            token: r.string()?,
        },
        PacketKind::ClientToServerHandshake => FrontPacket::ClientToServerHandshake,
        PacketKind::Disconnect => FrontPacket::Disconnect {
            hide_screen: r.bool()?,
            message: r.string()?,
        },
        PacketKind::ResourcePacksInfo => {
            let forced = r.bool()?;
            let forcing_server_packs = if codec.map_or(true, |c| c.pack_info_has_forcing_flag()) {
                r.bool()?
            } else {
                false
            };
            FrontPacket::ResourcePacksInfo {
                forced,
                forcing_server_packs,
                behavior_packs: r.list(read_info_entry)?,
                resource_packs: r.list(read_info_entry)?,
            }
        }
        PacketKind::ResourcePackStack => FrontPacket::ResourcePackStack {
            forced: r.bool()?,
            behavior_packs: r.list(read_stack_entry)?,
            resource_packs: r.list(read_stack_entry)?,
            game_version: r.string()?,
        },
        PacketKind::ResourcePackClientResponse => FrontPacket::ResourcePackClientResponse {
            status: PackResponseStatus::from_wire(r.u8()?),
            pack_ids: r.list(|r| r.string())?,
        },
        PacketKind::Text => FrontPacket::Text {
            kind: r.u8()?,
            source: r.string()?,
            message: r.string()?,
        },
        PacketKind::StartGame => FrontPacket::StartGame {
            entity_id: r.i64()?,
            runtime_id: r.u64()?,
            dimension: r.i32()?,
            position: read_vec3(&mut r)?,
            world_name: r.string()?,
            game_version: r.string()?,
        },
        PacketKind::MovePlayer => FrontPacket::MovePlayer {
            runtime_id: r.u64()?,
            position: read_vec3(&mut r)?,
            pitch: r.f32()?,
            yaw: r.f32()?,
            mode: r.u8()?,
            on_ground: r.bool()?,
        },
        PacketKind::MobEffect => FrontPacket::MobEffect {
            runtime_id: r.u64()?,
            event: r.u8()?,
            effect_id: r.i32()?,
            amplifier: r.i32()?,
            duration: r.i32()?,
        },
        PacketKind::Animate => FrontPacket::Animate {
            action: r.i32()?,
            runtime_id: r.u64()?,
        },
        PacketKind::LevelChunk => FrontPacket::LevelChunk {
            chunk_x: r.i32()?,
            chunk_z: r.i32()?,
            sub_chunk_count: r.u32()?,
            data: Bytes::copy_from_slice(r.blob()?),
        },
        PacketKind::ChangeDimension => {
            let dimension = r.i32()?;
            let position = read_vec3(&mut r)?;
            let respawn = r.bool()?;
            let loading_screen_id = if codec.map_or(false, |c| c.has_loading_screen_id()) && r.bool()? {
                Some(r.u32()?)
            } else {
                None
            };
            FrontPacket::ChangeDimension {
                dimension,
                position,
                respawn,
                loading_screen_id,
            }
        }
        PacketKind::RequestChunkRadius => FrontPacket::RequestChunkRadius { radius: r.i32()? },
        PacketKind::ChunkRadiusUpdated => FrontPacket::ChunkRadiusUpdated { radius: r.i32()? },
        PacketKind::ResourcePackDataInfo => FrontPacket::ResourcePackDataInfo {
            pack_id: r.string()?,
            max_chunk_size: r.u32()?,
            chunk_count: r.u32()?,
            size: r.u64()?,
            hash: r.blob()?.to_vec(),
            premium: r.bool()?,
            pack_type: r.u8()?,
        },
        PacketKind::ResourcePackChunkData => FrontPacket::ResourcePackChunkData {
            pack_id: r.string()?,
            chunk_index: r.u32()?,
            progress: r.u64()?,
            data: Bytes::copy_from_slice(r.blob()?),
        },
        PacketKind::ResourcePackChunkRequest => FrontPacket::ResourcePackChunkRequest {
            pack_id: r.string()?,
            chunk_index: r.u32()?,
        },
        PacketKind::StopSound => FrontPacket::StopSound {
            sound_name: r.string()?,
            stop_all: r.bool()?,
        },
        PacketKind::SetTitle => FrontPacket::SetTitle {
            kind: r.i32()?,
            text: r.string()?,
        },
        PacketKind::ModalFormRequest => FrontPacket::ModalFormRequest {
            form_id: r.u32()?,
            form_data: r.string()?,
        },
        PacketKind::ModalFormResponse => {
            let form_id = r.u32()?;
            let response = if r.bool()? { Some(r.string()?) } else { None };
            FrontPacket::ModalFormResponse { form_id, response }
        }
        PacketKind::SetLocalPlayerAsInitialized => FrontPacket::SetLocalPlayerAsInitialized {
            runtime_id: r.u64()?,
        },
        PacketKind::NetworkStackLatency => FrontPacket::NetworkStackLatency {
            timestamp: r.i64()?,
            from_server: r.bool()?,
        },
        PacketKind::EmoteList => FrontPacket::EmoteList {
            runtime_id: r.u64()?,
            piece_ids: r.list(|r| r.string())?,
        },
        PacketKind::PlayerFog => FrontPacket::PlayerFog {
            stack: r.list(|r| r.string())?,
        },
    };

    Ok(packet)
}
