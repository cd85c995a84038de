//! Asset Transfer Controller
//!
//! Offers the configured packs, then serves chunk requests one pack at a
//! time. Only the active pack (the one whose data info went out last) is
//! served, in order; an earlier index is a retransmit and is served again
//! without moving the cursor. Finished packs can always be re-served.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::{ConnectionState, DisconnectKind, Session};
use crate::config::PackCategory;
use crate::packs::{base_pack_id, Pack, PackOffer, CHUNK_SIZE};
use crate::protocol::front::{FrontPacket, PackInfoEntry, PackResponseStatus, PackStackEntry};

pub const PACK_TYPE_RESOURCE: u8 = 6;
pub const PACK_TYPE_BEHAVIOR: u8 = 4;

fn pack_type(category: PackCategory) -> u8 {
    match category {
        PackCategory::Resource => PACK_TYPE_RESOURCE,
        PackCategory::Behavior => PACK_TYPE_BEHAVIOR,
    }
}

/// Progress through one pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCursor {
    pub next_chunk_index: u32,
    pub chunk_count: u32,
}

/// What to do with one chunk request.
#[derive(Debug)]
pub enum ChunkDecision {
    Serve { pack: Arc<Pack>, last: bool },
    Retransmit { pack: Arc<Pack> },
    UnknownPack,
    /// Offered, but queued behind the active pack or never requested
    NotStarted,
    /// Ahead of the next chunk the active pack expects
    OutOfOrder { expected: u32 },
    OutOfRange { count: u32 },
}

/// Per-session pack transfer state.
#[derive(Debug, Default)]
pub struct AssetTransfer {
    offer: PackOffer,
    queue: VecDeque<Arc<Pack>>,
    active: Option<(String, TransferCursor)>,
    finished: HashSet<String>,
}

impl AssetTransfer {
    pub fn new(offer: PackOffer) -> Self {
        Self {
            offer,
            ..Self::default()
        }
    }

    pub fn offer(&self) -> &PackOffer {
        &self.offer
    }

    /// Cursor of `pack_id` while it is the active transfer
    pub fn cursor(&self, pack_id: &str) -> Option<TransferCursor> {
        let id = base_pack_id(pack_id);
        self.active.as_ref().filter(|(active, _)| active == id).map(|(_, cursor)| *cursor)
    }

    pub fn is_finished(&self, pack_id: &str) -> bool {
        self.finished.contains(base_pack_id(pack_id))
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue requested packs; unknown ids and repeats are skipped.
    pub fn enqueue(&mut self, requested: &[String]) -> usize {
        let mut added = 0;
        for id in requested {
            let Some(pack) = self.offer.find(id) else {
                tracing::debug!("[assets] [unknown_request] id={}", id);
                continue;
            };
            let active = self.active.as_ref().is_some_and(|(active, _)| *active == pack.id);
            if active || self.finished.contains(&pack.id) || self.queue.iter().any(|q| q.id == pack.id) {
                continue;
            }
            self.queue.push_back(pack);
            added += 1;
        }
        added
    }

    /// Make the next queued pack active. Nothing happens while one is
    /// still in flight.
    pub fn start_next(&mut self) -> Option<Arc<Pack>> {
        if self.active.is_some() {
            return None;
        }
        let pack = self.queue.pop_front()?;
        let cursor = TransferCursor {
            next_chunk_index: 0,
            chunk_count: pack.chunk_count(),
        };
        self.active = Some((pack.id.clone(), cursor));
        Some(pack)
    }

    pub fn check_request(&mut self, pack_id: &str, chunk_index: u32) -> ChunkDecision {
        let Some(pack) = self.offer.find(pack_id) else {
            return ChunkDecision::UnknownPack;
        };
        let count = pack.chunk_count();
        if chunk_index >= count {
            return ChunkDecision::OutOfRange { count };
        }
        if self.finished.contains(&pack.id) {
            return ChunkDecision::Retransmit { pack };
        }

        let cursor = match self.active.as_mut() {
            Some((active, cursor)) if *active == pack.id => cursor,
            _ => return ChunkDecision::NotStarted,
        };
        if chunk_index < cursor.next_chunk_index {
            return ChunkDecision::Retransmit { pack };
        }
        if chunk_index > cursor.next_chunk_index {
            return ChunkDecision::OutOfOrder {
                expected: cursor.next_chunk_index,
            };
        }

        cursor.next_chunk_index += 1;
        let last = cursor.next_chunk_index >= cursor.chunk_count;
        if last {
            self.active = None;
            self.finished.insert(pack.id.clone());
        }
        ChunkDecision::Serve { pack, last }
    }
}

fn info_entry(pack: &Pack) -> PackInfoEntry {
    PackInfoEntry {
        id: pack.id.clone(),
        version: pack.version.clone(),
        size: pack.size,
        content_key: pack.content_key.clone(),
        sub_pack_id: String::new(),
    }
}

fn stack_entry(pack: &Pack) -> PackStackEntry {
    PackStackEntry {
        id: pack.id.clone(),
        version: pack.version.clone(),
        sub_pack_name: String::new(),
    }
}

impl Session {
    pub(super) fn begin_asset_transfer(&mut self) {
        let optional = self
            .login
            .as_ref()
            .map(|l| self.ctx.config.optional_pack_numbers(&l.identity.xuid))
            .unwrap_or_default();
        let offer = self.ctx.packs().offer_for(&optional);

        let packet = FrontPacket::ResourcePacksInfo {
            forced: self.ctx.config.force_resource_packs,
            forcing_server_packs: false,
            behavior_packs: offer.behavior.iter().map(|p| info_entry(p)).collect(),
            resource_packs: offer
                .resource
                .iter()
                .chain(offer.optional.iter())
                .map(|p| info_entry(p))
                .collect(),
        };
        tracing::debug!(
            "[assets] [offer] session={} resource={} behavior={} optional={}",
            self.id,
            offer.resource.len(),
            offer.behavior.len(),
            offer.optional.len()
        );
        self.assets = AssetTransfer::new(offer);
        self.state = ConnectionState::AwaitingAssetTransfer;
        self.send_front(&packet);
    }

    fn send_pack_data_info(&mut self, pack: &Pack) {
        self.send_front(&FrontPacket::ResourcePackDataInfo {
            pack_id: pack.versioned_id(),
            max_chunk_size: CHUNK_SIZE as u32,
            chunk_count: pack.chunk_count(),
            size: pack.size,
            hash: pack.sha256.to_vec(),
            premium: false,
            pack_type: pack_type(pack.category),
        });
    }

    pub(super) fn handle_pack_response(&mut self, status: PackResponseStatus, pack_ids: Vec<String>) {
        if self.state != ConnectionState::AwaitingAssetTransfer {
            tracing::debug!("[assets] [late_response] session={} status={:?}", self.id, status);
            return;
        }

        match status {
            PackResponseStatus::SendPacks => {
                let added = self.assets.enqueue(&pack_ids);
                tracing::debug!("[assets] [send_packs] session={} queued={}", self.id, added);
                if let Some(pack) = self.assets.start_next() {
                    self.send_pack_data_info(&pack);
                }
            }
            PackResponseStatus::HaveAllPacks => {
                let offer = self.assets.offer();
                let game_version = self
                    .login
                    .as_ref()
                    .map(|l| l.client_data.game_version.clone())
                    .unwrap_or_default();
                let packet = FrontPacket::ResourcePackStack {
                    forced: true,
                    behavior_packs: offer.behavior.iter().map(|p| stack_entry(p)).collect(),
                    resource_packs: offer
                        .resource
                        .iter()
                        .chain(offer.optional.iter())
                        .map(|p| stack_entry(p))
                        .collect(),
                    game_version,
                };
                self.send_front(&packet);
            }
            PackResponseStatus::Completed => {
                tracing::debug!("[assets] [complete] session={}", self.id);
                self.begin_backend_auth();
            }
            PackResponseStatus::Refused | PackResponseStatus::Other(_) => {
                self.disconnect(DisconnectKind::ResourcePackRefused, "");
            }
        }
    }

    pub(super) fn handle_chunk_request(&mut self, pack_id: &str, chunk_index: u32) {
        if self.state != ConnectionState::AwaitingAssetTransfer {
            tracing::debug!("[assets] [late_chunk_request] session={} pack={}", self.id, pack_id);
            return;
        }

        let (pack, last) = match self.assets.check_request(pack_id, chunk_index) {
            ChunkDecision::Serve { pack, last } => (pack, last),
            ChunkDecision::Retransmit { pack } => {
                tracing::debug!(
                    "[assets] [retransmit] session={} pack={} chunk={}",
                    self.id,
                    pack.id,
                    chunk_index
                );
                (pack, false)
            }
            ChunkDecision::UnknownPack => {
                tracing::debug!("[assets] [unknown_pack] session={} pack={}", self.id, pack_id);
                return;
            }
            ChunkDecision::NotStarted => {
                tracing::debug!("[assets] [pack_not_started] session={} pack={}", self.id, pack_id);
                return;
            }
            ChunkDecision::OutOfOrder { expected } => {
                tracing::debug!(
                    "[assets] [chunk_out_of_order] session={} pack={} chunk={} expected={}",
                    self.id,
                    pack_id,
                    chunk_index,
                    expected
                );
                return;
            }
            ChunkDecision::OutOfRange { count } => {
                tracing::debug!(
                    "[assets] [chunk_out_of_range] session={} pack={} chunk={} count={}",
                    self.id,
                    pack_id,
                    chunk_index,
                    count
                );
                return;
            }
        };

        let data = match pack.read_chunk(chunk_index) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("[assets] [read_failed] session={} error={}", self.id, e);
                return;
            }
        };
        self.send_front(&FrontPacket::ResourcePackChunkData {
            pack_id: pack_id.to_string(),
            chunk_index,
            progress: chunk_index as u64 * CHUNK_SIZE,
            data,
        });

        if last {
            if let Some(next) = self.assets.start_next() {
                self.send_pack_data_info(&next);
            }
        }
    }
}
