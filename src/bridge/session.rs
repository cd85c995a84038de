//! Per-connection session state and its packet/event dispatch.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::assets::AssetTransfer;
use super::auth::DeviceCode;
use super::backend::{BackInbound, BackSender};
use super::dimension::WorldState;
use super::handshake::LoginIdentity;
use super::tick::TickState;
use super::translate::TranslateCtx;
use super::{
    ConnectionState, DecodeFailure, DisconnectKind, DisconnectReason, FrontLink, HandshakeStage, SessionEvent,
    SessionSummary,
};
use crate::lang;
use crate::protocol::back::{BackPacket, BackState};
use crate::protocol::front::{FrontPacket, ANIMATE_SWING_ARM, MOVE_MODE_NORMAL, TITLE_ACTIONBAR};
use crate::server::ProxyContext;

/// Account the backend knows the player as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub name: String,
    pub uuid: Uuid,
}

pub struct Session {
    pub(super) id: u64,
    pub(super) ctx: Arc<ProxyContext>,
    pub(super) peer: SocketAddr,
    pub(super) state: ConnectionState,
    pub(super) front: FrontLink,
    pub(super) events_tx: mpsc::UnboundedSender<SessionEvent>,

    // backend leg
    pub(super) back: Option<BackSender>,
    pub(super) pending_back_rx: Option<mpsc::UnboundedReceiver<BackInbound>>,
    pub(super) back_state: BackState,
    pub(super) saw_encryption_request: bool,
    /// Appended to the backend handshake host
    pub(super) handshake_suffix: String,

    pub(super) login: Option<LoginIdentity>,
    pub(super) profile: Option<BackendProfile>,

    pub(super) assets: AssetTransfer,
    pub(super) world: WorldState,
    pub(super) tick: TickState,

    pub(super) look_back: Option<AbortHandle>,
    pub(super) look_back_rotation: (f32, f32),
    pub(super) auth_watch: Option<AbortHandle>,

    /// Emote pieces this client already knows
    pub(super) emotes: HashSet<String>,
    pub(super) start_game_sent: bool,
    pub(super) logging_in: bool,
    pub(super) registered: bool,
    pub(super) closed: bool,
    pub(super) close_reason: Option<DisconnectReason>,
    pub(super) shown_form: Option<u32>,
    /// Open form, resent once the client has loaded
    pub(super) form_cache: Option<(u32, String)>,
    /// Set once the client reports it left the loading screen; never reset
    pub(super) client_loaded: bool,
    pub(super) device_code: Option<DeviceCode>,
}

impl Session {
    pub fn new(
        id: u64,
        ctx: Arc<ProxyContext>,
        peer: SocketAddr,
        front: FrontLink,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let emotes = ctx.sessions.known_emotes().into_iter().collect();
        Self {
            id,
            ctx,
            peer,
            state: ConnectionState::Connecting,
            front,
            events_tx,
            back: None,
            pending_back_rx: None,
            back_state: BackState::Handshake,
            saw_encryption_request: false,
            handshake_suffix: String::new(),
            login: None,
            profile: None,
            assets: AssetTransfer::default(),
            world: WorldState::default(),
            tick: TickState::default(),
            look_back: None,
            look_back_rotation: (0.0, 0.0),
            auth_watch: None,
            emotes,
            start_game_sent: false,
            logging_in: false,
            registered: false,
            closed: false,
            close_reason: None,
            shown_form: None,
            form_cache: None,
            client_loaded: false,
            device_code: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Why the session closed, once it has
    pub fn close_reason(&self) -> Option<&DisconnectReason> {
        self.close_reason.as_ref()
    }

    pub fn has_backend(&self) -> bool {
        self.back.is_some()
    }

    /// Inbound half of a freshly attached backend link, handed to the loop once
    pub fn take_back_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BackInbound>> {
        self.pending_back_rx.take()
    }

    pub fn tick_active(&self) -> bool {
        self.tick.enabled && !self.closed
    }

    pub fn display_name(&self) -> Option<&str> {
        self.login.as_ref().map(|l| l.identity.display_name.as_str())
    }

    pub fn xuid(&self) -> Option<&str> {
        self.login.as_ref().map(|l| l.identity.xuid.as_str())
    }

    /// Peer address as it may appear in logs
    pub(super) fn peer_label(&self) -> String {
        if self.ctx.config.log_player_ip_addresses {
            self.peer.to_string()
        } else {
            "<IP address withheld>".to_string()
        }
    }

    pub fn start(&mut self) {
        self.state = ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingSettingsRequest);
        tracing::info!("[session] [open] session={} addr={}", self.id, self.peer_label());
    }

    pub fn send_front(&mut self, packet: &FrontPacket) {
        if self.closed {
            return;
        }
        self.world.caches.observe(packet);
        if let Err(e) = self.front.send(packet) {
            tracing::warn!(
                "[session] [front_send_failed] session={} packet={} error={}",
                self.id,
                packet.name(),
                e
            );
        }
    }

    pub fn send_back(&mut self, packet: &BackPacket) {
        let Some(back) = self.back.as_ref() else {
            tracing::debug!("[session] [no_backend] session={} packet={}", self.id, packet.name());
            return;
        };
        if let Err(e) = back.send(packet) {
            tracing::debug!(
                "[session] [back_send_failed] session={} packet={} error={}",
                self.id,
                packet.name(),
                e
            );
        }
    }

    // ============================================
    // Front dispatch
    // ============================================

    pub fn handle_front_frame(&mut self, body: &[u8]) {
        if self.closed {
            return;
        }

        let packet = match self.front.decode(body) {
            Ok(packet) => packet,
            Err(DecodeFailure::Frame(e)) => {
                self.disconnect(DisconnectKind::ProtocolViolation, e.to_string());
                return;
            }
            Err(DecodeFailure::Packet(e)) => {
                match self.state {
                    // a client too old to negotiate settings speaks a layout we cannot read
                    ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingSettingsRequest) => {
                        let newest = self.ctx.codecs.default_descriptor().display_name();
                        self.disconnect(DisconnectKind::OutdatedClient, newest);
                    }
                    ConnectionState::AwaitingHandshake(_) => {
                        self.disconnect(DisconnectKind::ProtocolViolation, e.to_string());
                    }
                    _ => tracing::debug!("[session] [decode_skipped] session={} error={}", self.id, e),
                }
                return;
            }
        };

        self.dispatch(packet);
    }

    fn dispatch(&mut self, packet: FrontPacket) {
        match packet {
            FrontPacket::RequestNetworkSettings { protocol_version } => self.handle_settings_request(protocol_version),
            FrontPacket::Login {
                protocol_version,
                chain_data,
                client_data,
            } => self.handle_login(protocol_version, &chain_data, &client_data),
            FrontPacket::ClientToServerHandshake => {
                tracing::debug!("[session] [handshake_ack] session={}", self.id);
            }
            other if !self.state.is_post_handshake() => {
                self.disconnect(
                    DisconnectKind::ProtocolViolation,
                    format!("{} before handshake completed", other.name()),
                );
            }
            FrontPacket::ResourcePackClientResponse { status, pack_ids } => self.handle_pack_response(status, pack_ids),
            FrontPacket::ResourcePackChunkRequest { pack_id, chunk_index } => {
                self.handle_chunk_request(&pack_id, chunk_index)
            }
            other => self.handle_game_packet(other),
        }
    }

    fn handle_game_packet(&mut self, packet: FrontPacket) {
        if self.state == ConnectionState::AwaitingAssetTransfer {
            tracing::debug!(
                "[session] [early_packet] session={} packet={}",
                self.id,
                packet.name()
            );
            return;
        }

        match packet {
            FrontPacket::MovePlayer {
                position,
                pitch,
                yaw,
                on_ground,
                ..
            } => {
                if self.logging_in {
                    let text = self.ctx.messages.get(lang::WAIT_LOGIN).to_string();
                    self.send_front(&FrontPacket::SetTitle {
                        kind: TITLE_ACTIONBAR,
                        text,
                    });
                    return;
                }
                self.world.position = position;
                self.world.yaw = yaw;
                self.world.pitch = pitch;
                self.world.on_ground = on_ground;
                self.tick.last_move = Instant::now();
                if self.back_state == BackState::Play {
                    self.send_back(&BackPacket::MovePlayerPos {
                        x: position.x as f64,
                        y: position.y as f64,
                        z: position.z as f64,
                        on_ground,
                    });
                }
            }
            FrontPacket::Animate { action, runtime_id } => {
                if action == ANIMATE_SWING_ARM {
                    self.tick.arm_swing_pending();
                }
                self.translate_front(FrontPacket::Animate { action, runtime_id });
            }
            FrontPacket::ModalFormResponse { form_id, response } => self.handle_form_response(form_id, response),
            FrontPacket::NetworkStackLatency { timestamp, from_server } => {
                if self.back.is_none() {
                    self.send_front(&FrontPacket::NetworkStackLatency {
                        timestamp,
                        from_server: true,
                    });
                } else {
                    self.translate_front(FrontPacket::NetworkStackLatency { timestamp, from_server });
                }
            }
            FrontPacket::RequestChunkRadius { radius } => {
                self.world.render_distance = radius;
                self.send_front(&FrontPacket::ChunkRadiusUpdated { radius });
            }
            FrontPacket::SetLocalPlayerAsInitialized { .. } => {
                self.world.spawned = true;
                if self.state == ConnectionState::ConnectedToBackend {
                    self.state = ConnectionState::Spawned;
                }
                if !self.client_loaded {
                    self.client_loaded = true;
                    self.send_cached_form();
                }
            }
            FrontPacket::EmoteList { piece_ids, .. } => {
                self.emotes.extend(piece_ids.iter().cloned());
                let notified = self.ctx.sessions.broadcast_emotes(self.id, &piece_ids);
                tracing::debug!(
                    "[session] [emotes_shared] session={} pieces={} notified={}",
                    self.id,
                    piece_ids.len(),
                    notified
                );
            }
            other => self.translate_front(other),
        }
    }

    fn translate_front(&mut self, packet: FrontPacket) {
        let translator = Arc::clone(&self.ctx.translator);
        let mut ctx = TranslateCtx::new(self.id, &mut self.front, self.back.as_ref(), &mut self.world.caches);
        translator.translate_front(&mut ctx, packet);
    }

    pub(super) fn translate_back(&mut self, packet: BackPacket) {
        let translator = Arc::clone(&self.ctx.translator);
        let mut ctx = TranslateCtx::new(self.id, &mut self.front, self.back.as_ref(), &mut self.world.caches);
        translator.translate_back(&mut ctx, packet);
    }

    // ============================================
    // Events
    // ============================================

    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.closed {
            // a link that finished connecting after we closed still needs closing
            if let SessionEvent::BackendConnected(Ok(link)) = event {
                link.sender.close();
            }
            return;
        }

        match event {
            SessionEvent::BackendConnected(result) => self.on_backend_connected(result),
            SessionEvent::AuthProgress(state) => self.on_auth_progress(state),
            SessionEvent::RefreshFinished(result) => self.on_refresh_finished(result),
            SessionEvent::Emotes(pieces) => {
                let fresh: Vec<String> = pieces.into_iter().filter(|p| self.emotes.insert(p.clone())).collect();
                if !fresh.is_empty() && self.start_game_sent {
                    self.send_front(&FrontPacket::EmoteList {
                        runtime_id: self.world.runtime_id,
                        piece_ids: fresh,
                    });
                }
            }
            SessionEvent::LookBack => {
                self.look_back = None;
                let (yaw, pitch) = self.look_back_rotation;
                self.send_front(&FrontPacket::MovePlayer {
                    runtime_id: self.world.runtime_id,
                    position: self.world.position,
                    pitch,
                    yaw,
                    mode: MOVE_MODE_NORMAL,
                    on_ground: self.world.on_ground,
                });
            }
            SessionEvent::Kick(reason) => self.disconnect(DisconnectKind::Kicked, reason),
            SessionEvent::Shutdown => self.disconnect(DisconnectKind::ShuttingDown, ""),
        }
    }

    /// Re-send the camera rotation after `delay`. Replaces a pending one.
    pub fn schedule_look_back(&mut self, delay: Duration, yaw: f32, pitch: f32) {
        if let Some(handle) = self.look_back.take() {
            handle.abort();
        }
        self.look_back_rotation = (yaw, pitch);

        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::LookBack);
        });
        self.look_back = Some(task.abort_handle());
    }

    // ============================================
    // Disconnect
    // ============================================

    /// Close with the localized message for `kind`; `detail` fills `{0}`.
    pub fn disconnect(&mut self, kind: DisconnectKind, detail: impl AsRef<str>) {
        let message = self.ctx.messages.format(kind.message_key(), &[detail.as_ref()]);
        self.close(DisconnectReason { kind, message }, detail.as_ref());
    }

    pub fn disconnect_with_message(&mut self, kind: DisconnectKind, message: String) {
        let detail = message.clone();
        self.close(DisconnectReason { kind, message }, &detail);
    }

    fn close(&mut self, reason: DisconnectReason, detail: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        let name = self.display_name().unwrap_or("-").to_string();
        match reason.kind {
            DisconnectKind::ClientQuit | DisconnectKind::ShuttingDown | DisconnectKind::Kicked => tracing::info!(
                "[session] [disconnect] session={} name={} addr={} kind={:?} detail={}",
                self.id,
                name,
                self.peer_label(),
                reason.kind,
                detail
            ),
            _ => tracing::warn!(
                "[session] [disconnect] session={} name={} addr={} kind={:?} detail={}",
                self.id,
                name,
                self.peer_label(),
                reason.kind,
                detail
            ),
        }

        let summary = SessionSummary {
            id: self.id,
            peer: self.peer,
            display_name: self.display_name().map(str::to_string),
            xuid: self.xuid().map(str::to_string),
            last_state: self.state,
        };
        for observer in &self.ctx.observers {
            observer.on_disconnect(&summary, &reason);
        }

        if let Some(back) = self.back.take() {
            back.close();
        }
        self.pending_back_rx = None;

        if reason.kind != DisconnectKind::ClientQuit {
            let packet = FrontPacket::Disconnect {
                hide_screen: false,
                message: reason.message.clone(),
            };
            if let Err(e) = self.front.send(&packet) {
                tracing::debug!("[session] [disconnect_send_failed] session={} error={}", self.id, e);
            }
        }
        self.front.close();

        if self.registered {
            self.ctx.sessions.remove(self.id);
            self.registered = false;
        }

        // a pending login survives the session so a reconnect can pick it up
        if let Some(xuid) = self.xuid() {
            if let Some(task) = self.ctx.pending_auth.get(xuid) {
                task.set_online(false);
            }
        }
        if let Some(handle) = self.auth_watch.take() {
            handle.abort();
        }

        self.tick.enabled = false;
        if let Some(handle) = self.look_back.take() {
            handle.abort();
        }
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
    }
}
