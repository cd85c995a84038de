//! Codec Registry
//!
//! One immutable descriptor per supported front protocol version, built
//! once at startup and shared by `Arc`. The back leg has a single fixed
//! descriptor.

use std::collections::HashMap;
use std::sync::Arc;

/// Newest supported front protocol version
pub const DEFAULT_PROTOCOL_VERSION: u32 = 594;

/// First version that negotiates network settings before login
pub const NETWORK_SETTINGS_MIN_VERSION: u32 = 554;

/// Supported front versions and their display names, oldest first
const SUPPORTED: &[(u32, &str)] = &[
    (503, "1.18.30/1.18.31"),
    (504, "1.18.32"),
    (527, "1.19.0/1.19.2"),
    (534, "1.19.10/1.19.11"),
    (545, "1.19.21/1.19.22"),
    (554, "1.19.30/1.19.31"),
    (557, "1.19.40/1.19.41"),
    (560, "1.19.50/1.19.51"),
    (582, "1.19.80/1.19.81"),
    (589, "1.20.0/1.20.1"),
    (594, "1.20.10/1.20.12"),
];

pub fn is_pre_1_20(version: u32) -> bool {
    version < 589
}

pub fn is_pre_1_20_10(version: u32) -> bool {
    version < 594
}

/// Structured front packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Login,
    PlayStatus,
    ServerToClientHandshake,
    ClientToServerHandshake,
    Disconnect,
    ResourcePacksInfo,
    ResourcePackStack,
    ResourcePackClientResponse,
    Text,
    StartGame,
    MovePlayer,
    MobEffect,
    Animate,
    LevelChunk,
    ChangeDimension,
    RequestChunkRadius,
    ChunkRadiusUpdated,
    NetworkSettings,
    ResourcePackDataInfo,
    ResourcePackChunkData,
    ResourcePackChunkRequest,
    StopSound,
    SetTitle,
    ModalFormRequest,
    ModalFormResponse,
    SetLocalPlayerAsInitialized,
    NetworkStackLatency,
    EmoteList,
    PlayerFog,
    RequestNetworkSettings,
}

/// (kind, wire id, first version carrying it)
const PACKET_IDS: &[(PacketKind, u16, u32)] = &[
    (PacketKind::Login, 0x01, 0),
    (PacketKind::PlayStatus, 0x02, 0),
    (PacketKind::ServerToClientHandshake, 0x03, 0),
    (PacketKind::ClientToServerHandshake, 0x04, 0),
    (PacketKind::Disconnect, 0x05, 0),
    (PacketKind::ResourcePacksInfo, 0x06, 0),
    (PacketKind::ResourcePackStack, 0x07, 0),
    (PacketKind::ResourcePackClientResponse, 0x08, 0),
    (PacketKind::Text, 0x09, 0),
    (PacketKind::StartGame, 0x0B, 0),
    (PacketKind::MovePlayer, 0x13, 0),
    (PacketKind::MobEffect, 0x1C, 0),
    (PacketKind::Animate, 0x2C, 0),
    (PacketKind::LevelChunk, 0x3A, 0),
    (PacketKind::ChangeDimension, 0x3D, 0),
    (PacketKind::RequestChunkRadius, 0x45, 0),
    (PacketKind::ChunkRadiusUpdated, 0x46, 0),
    (PacketKind::NetworkSettings, 0x8F, NETWORK_SETTINGS_MIN_VERSION),
    (PacketKind::ResourcePackDataInfo, 0x52, 0),
    (PacketKind::ResourcePackChunkData, 0x53, 0),
    (PacketKind::ResourcePackChunkRequest, 0x54, 0),
    (PacketKind::StopSound, 0x57, 0),
    (PacketKind::SetTitle, 0x58, 0),
    (PacketKind::ModalFormRequest, 0x64, 0),
    (PacketKind::ModalFormResponse, 0x65, 0),
    (PacketKind::SetLocalPlayerAsInitialized, 0x71, 0),
    (PacketKind::NetworkStackLatency, 0x73, 0),
    (PacketKind::EmoteList, 0x98, 0),
    (PacketKind::PlayerFog, 0xA0, 0),
    (PacketKind::RequestNetworkSettings, 0xC1, NETWORK_SETTINGS_MIN_VERSION),
];

/// Packets understood before any codec is bound to the session.
const BOOTSTRAP: &[PacketKind] = &[
    PacketKind::RequestNetworkSettings,
    PacketKind::NetworkSettings,
    PacketKind::Login,
    PacketKind::PlayStatus,
    PacketKind::Disconnect,
];

pub fn wire_id(kind: PacketKind) -> u16 {
    PACKET_IDS
        .iter()
        .find(|(k, _, _)| *k == kind)
        .map(|(_, id, _)| *id)
        .unwrap_or(0)
}

/// Kind of a pre-negotiation packet id, if it is one.
pub fn bootstrap_kind(id: u16) -> Option<PacketKind> {
    PACKET_IDS
        .iter()
        .find(|(k, pid, _)| *pid == id && BOOTSTRAP.contains(k))
        .map(|(k, _, _)| *k)
}

/// Immutable description of one front protocol version.
#[derive(Debug)]
pub struct CodecDescriptor {
    version: u32,
    display_name: &'static str,
    packet_table: HashMap<u16, PacketKind>,
}

impl CodecDescriptor {
    fn build(version: u32, display_name: &'static str) -> Self {
        let packet_table = PACKET_IDS
            .iter()
            .filter(|(_, _, since)| version >= *since)
            .map(|(kind, id, _)| (*id, *kind))
            .collect();
        Self {
            version,
            display_name,
            packet_table,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn display_name(&self) -> &'static str {
        self.display_name
    }

    pub fn kind_of(&self, id: u16) -> Option<PacketKind> {
        self.packet_table.get(&id).copied()
    }

    pub fn has(&self, kind: PacketKind) -> bool {
        self.packet_table.values().any(|k| *k == kind)
    }

    pub fn supports_network_settings(&self) -> bool {
        self.has(PacketKind::RequestNetworkSettings)
    }

    /// Pack info carries the "forcing server packs" flag from 1.19.30 on
    pub fn pack_info_has_forcing_flag(&self) -> bool {
        self.version >= NETWORK_SETTINGS_MIN_VERSION
    }

    /// Change-dimension carries a loading screen id from 1.20 on
    pub fn has_loading_screen_id(&self) -> bool {
        !is_pre_1_20(self.version)
    }
}

/// Result of matching a client's announced version.
#[derive(Debug, Clone)]
pub enum VersionMatch {
    Supported(Arc<CodecDescriptor>),
    /// Client is newer than anything supported
    ClientTooNew,
    /// Client is older than anything supported
    ClientTooOld,
}

/// Process-wide version table, read-only after construction.
#[derive(Debug)]
pub struct CodecRegistry {
    codecs: Vec<Arc<CodecDescriptor>>,
    default_index: usize,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let codecs: Vec<Arc<CodecDescriptor>> = SUPPORTED
            .iter()
            .map(|(v, name)| Arc::new(CodecDescriptor::build(*v, name)))
            .collect();
        let default_index = codecs
            .iter()
            .position(|c| c.version == DEFAULT_PROTOCOL_VERSION)
            .unwrap_or(codecs.len() - 1);
        Self {
            codecs,
            default_index,
        }
    }

    pub fn lookup(&self, version: u32) -> Option<Arc<CodecDescriptor>> {
        self.codecs.iter().find(|c| c.version == version).cloned()
    }

    pub fn default_descriptor(&self) -> &Arc<CodecDescriptor> {
        &self.codecs[self.default_index]
    }

    /// Display names of every supported version, oldest first
    pub fn describe_supported(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|c| c.display_name).collect()
    }

    pub fn classify(&self, version: u32) -> VersionMatch {
        match self.lookup(version) {
            Some(codec) => VersionMatch::Supported(codec),
            None if version > self.default_descriptor().version => VersionMatch::ClientTooNew,
            None => VersionMatch::ClientTooOld,
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The single backend protocol version
#[derive(Debug, Clone, Copy)]
pub struct BackCodec {
    pub version: i32,
    pub display_name: &'static str,
}

pub const BACK_CODEC: BackCodec = BackCodec {
    version: 763,
    display_name: "1.20.1",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_every_supported_version() {
        let registry = CodecRegistry::new();
        for (v, name) in SUPPORTED {
            let codec = registry.lookup(*v).unwrap();
            assert_eq!(codec.version(), *v);
            assert_eq!(codec.display_name(), *name);
        }
    }

    #[test]
    fn test_lookup_unknown_version() {
        let registry = CodecRegistry::new();
        assert!(registry.lookup(999).is_none());
        assert!(registry.lookup(0).is_none());
        assert!(registry.lookup(590).is_none());
    }

    #[test]
    fn test_default_is_newest() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.default_descriptor().version(), DEFAULT_PROTOCOL_VERSION);
        assert_eq!(
            registry.describe_supported().last().copied(),
            Some("1.20.10/1.20.12")
        );
    }

    #[test]
    fn test_classify_mismatch() {
        let registry = CodecRegistry::new();
        assert!(matches!(registry.classify(999), VersionMatch::ClientTooNew));
        assert!(matches!(registry.classify(400), VersionMatch::ClientTooOld));
        // Gap between supported versions is still "older than default"
        assert!(matches!(registry.classify(590), VersionMatch::ClientTooOld));
        assert!(matches!(registry.classify(594), VersionMatch::Supported(_)));
    }

    #[test]
    fn test_settings_packets_gated_by_version() {
        let registry = CodecRegistry::new();
        assert!(!registry.lookup(545).unwrap().supports_network_settings());
        assert!(registry.lookup(554).unwrap().supports_network_settings());
        assert_eq!(registry.lookup(545).unwrap().kind_of(0xC1), None);
        assert_eq!(
            registry.lookup(594).unwrap().kind_of(0xC1),
            Some(PacketKind::RequestNetworkSettings)
        );
    }

    #[test]
    fn test_version_predicates() {
        assert!(is_pre_1_20(582));
        assert!(!is_pre_1_20(589));
        assert!(is_pre_1_20_10(589));
        assert!(!is_pre_1_20_10(594));
    }

    #[test]
    fn test_bootstrap_kinds() {
        assert_eq!(bootstrap_kind(0xC1), Some(PacketKind::RequestNetworkSettings));
        assert_eq!(bootstrap_kind(0x01), Some(PacketKind::Login));
        assert_eq!(bootstrap_kind(0x54), None);
    }
}
