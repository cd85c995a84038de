//! Backend authentication and connection.
//!
//! Picks the identity the backend will see, runs the account login when the
//! backend needs one, opens the backend link and follows it through login
//! into play.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use super::auth::{forwarded_uuid, offline_uuid, AuthError, AuthTask, AuthTaskState, AuthenticatedProfile};
use super::backend::{
    classify_login_close, forwarded_suffix, intention_host, BackInbound, BackLink, BackendError, BackendTarget,
    ForwardedIdentity,
};
use super::dimension::{
    front_dimension, placeholder_chunks, BEDROCK_OVERWORLD, NETHER, NETHER_FOG, PLACEHOLDER_POSITION,
    PLACEHOLDER_RADIUS,
};
use super::session::BackendProfile;
use super::tick::{front_effect_id, WorldBorder};
use super::{ConnectionState, DisconnectKind, Session, SessionEvent};
use crate::config::AuthType;
use crate::lang;
use crate::protocol::back::{self, BackPacket, BackState, Direction, INTENTION_LOGIN};
use crate::protocol::codec::BACK_CODEC;
use crate::protocol::front::{
    FrontPacket, PlayStatusKind, Vec3, MOB_EFFECT_ADD, MOB_EFFECT_MODIFY, MOB_EFFECT_REMOVE, MOVE_MODE_TELEPORT,
    TEXT_SYSTEM,
};

/// Delay before the camera rotation is re-sent after a backend teleport
pub const LOOK_BACK_DELAY: Duration = Duration::from_millis(250);

impl Session {
    pub(super) fn begin_backend_auth(&mut self) {
        self.state = ConnectionState::AuthenticatingBackend;
        self.logging_in = true;

        let Some(login) = self.login.as_ref() else {
            self.disconnect(DisconnectKind::Internal, "no login identity");
            return;
        };
        let name = login.identity.display_name.clone();
        let forwarded = ForwardedIdentity {
            game_version: login.client_data.game_version.clone(),
            display_name: name.clone(),
            xuid: login.identity.xuid.clone(),
            device_os: login.client_data.device_os,
            language_code: login.client_data.language_code.clone(),
            ui_profile: login.client_data.ui_profile,
            input_mode: login.client_data.current_input_mode,
            client_ip: self.peer.ip().to_string(),
        };

        match self.ctx.config.remote.auth_type {
            AuthType::Offline => {
                self.profile = Some(BackendProfile {
                    uuid: offline_uuid(&name),
                    name,
                });
                self.connect_backend(String::new());
            }
            AuthType::Floodgate => {
                let Some(key) = self.ctx.floodgate_key else {
                    self.disconnect(DisconnectKind::Internal, "floodgate key not configured");
                    return;
                };
                match forwarded_suffix(&key, &forwarded) {
                    Ok(suffix) => {
                        self.profile = Some(BackendProfile {
                            uuid: forwarded_uuid(&forwarded.xuid),
                            name,
                        });
                        self.connect_backend(suffix);
                    }
                    Err(e) => self.disconnect(DisconnectKind::Internal, e.to_string()),
                }
            }
            AuthType::Online => self.authenticate_online(),
        }
    }

    fn authenticate_online(&mut self) {
        let name = self.display_name().unwrap_or_default().to_string();
        let xuid = self.xuid().unwrap_or_default().to_string();

        if self.ctx.config.saved_user_logins.contains(&name) {
            let token = {
                let store = self.ctx.credentials.lock().unwrap_or_else(PoisonError::into_inner);
                store.get(&name).map(str::to_string)
            };
            if let Some(token) = token {
                tracing::debug!("[connect] [refresh_login] session={} name={}", self.id, name);
                let auth = Arc::clone(&self.ctx.auth);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = auth.refresh(token).await;
                    let _ = tx.send(SessionEvent::RefreshFinished(result));
                });
                return;
            }
        }

        if let Some(task) = self.ctx.pending_auth.get(&xuid) {
            tracing::debug!("[connect] [resume_pending_login] session={} xuid={}", self.id, xuid);
            task.set_online(true);
            self.spawn_placeholder_world();
            self.watch_auth_task(task);
            return;
        }

        self.spawn_placeholder_world();
        self.show_login_notice();
    }

    /// Start (or rejoin) the device-code login for this player.
    pub(super) fn start_device_code_login(&mut self) {
        let Some(xuid) = self.xuid().map(str::to_string) else {
            return;
        };
        let (task, created) = self.ctx.pending_auth.get_or_create(&xuid);
        if created {
            tracing::info!("[connect] [device_code_start] session={} xuid={}", self.id, xuid);
            tokio::spawn(Arc::clone(&task).drive(Arc::clone(&self.ctx.auth)));
        }
        self.watch_auth_task(task);
    }

    /// Forward the task's state changes into this session's loop.
    fn watch_auth_task(&mut self, task: Arc<AuthTask>) {
        let mut rx = task.subscribe();
        let tx = self.events_tx.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                let done = matches!(state, AuthTaskState::Completed(_));
                if state != AuthTaskState::Starting && tx.send(SessionEvent::AuthProgress(state)).is_err() {
                    return;
                }
                if done || rx.changed().await.is_err() {
                    return;
                }
            }
        });
        if let Some(previous) = self.auth_watch.replace(watcher.abort_handle()) {
            previous.abort();
        }
    }

    pub(super) fn on_auth_progress(&mut self, state: AuthTaskState) {
        match state {
            AuthTaskState::Starting => {}
            AuthTaskState::CodeIssued(code) => {
                if self.device_code.as_ref() != Some(&code) {
                    self.show_device_code(&code);
                }
            }
            AuthTaskState::Completed(result) => {
                if let Some(xuid) = self.xuid() {
                    self.ctx.pending_auth.remove(xuid);
                }
                self.auth_watch = None;
                match result {
                    Ok(profile) => self.on_account_login(profile),
                    Err(e) => self.disconnect(DisconnectKind::AuthenticationFailed, e.to_string()),
                }
            }
        }
    }

    pub(super) fn on_refresh_finished(&mut self, result: Result<AuthenticatedProfile, AuthError>) {
        match result {
            Ok(profile) => self.on_account_login(profile),
            Err(e) => {
                tracing::info!("[connect] [refresh_failed] session={} error={}", self.id, e);
                self.spawn_placeholder_world();
                self.show_token_expired();
            }
        }
    }

    fn on_account_login(&mut self, profile: AuthenticatedProfile) {
        let name = self.display_name().unwrap_or_default().to_string();
        if let Some(token) = profile.refresh_token.as_deref() {
            if self.ctx.config.saved_user_logins.contains(&name) {
                let mut store = self.ctx.credentials.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = store.store(&name, token) {
                    tracing::warn!("[connect] [token_store_failed] session={} error={:#}", self.id, e);
                }
            }
        }

        tracing::info!(
            "[connect] [account_login] session={} name={} account={}",
            self.id,
            name,
            profile.name
        );
        if self.start_game_sent {
            let message = self.ctx.messages.format(lang::LOGIN_SUCCESS, &[&profile.name]);
            self.send_front(&FrontPacket::Text {
                kind: TEXT_SYSTEM,
                source: String::new(),
                message,
            });
        }
        self.clear_forms();
        self.profile = Some(BackendProfile {
            name: profile.name,
            uuid: profile.uuid,
        });
        self.connect_backend(String::new());
    }

    fn game_version(&self) -> String {
        match (&self.login, self.front.codec()) {
            (Some(login), _) if !login.client_data.game_version.is_empty() => login.client_data.game_version.clone(),
            (_, Some(codec)) => codec.display_name().to_string(),
            _ => String::new(),
        }
    }

    /// Spawn the client into an empty world so forms can be shown.
    pub(super) fn spawn_placeholder_world(&mut self) {
        if self.start_game_sent {
            return;
        }
        let game_version = self.game_version();
        self.send_front(&FrontPacket::StartGame {
            entity_id: 1,
            runtime_id: self.world.runtime_id,
            dimension: BEDROCK_OVERWORLD,
            position: PLACEHOLDER_POSITION,
            world_name: self.ctx.config.bedrock.server_name.clone(),
            game_version,
        });
        for chunk in placeholder_chunks(PLACEHOLDER_POSITION, PLACEHOLDER_RADIUS) {
            self.send_front(&chunk);
        }
        self.send_front(&FrontPacket::PlayStatus {
            status: PlayStatusKind::PlayerSpawn,
        });
        self.start_game_sent = true;
    }

    fn connect_backend(&mut self, suffix: String) {
        let remote = &self.ctx.config.remote;
        let target = BackendTarget {
            address: remote.address.clone(),
            port: remote.port,
            timeout: Duration::from_secs(remote.connect_timeout_secs),
            proxy_source: remote.use_proxy_protocol.then_some(self.peer),
        };
        tracing::info!(
            "[connect] [backend_connecting] session={} remote={}:{}",
            self.id,
            target.address,
            target.port
        );
        self.handshake_suffix = suffix;

        let connector = Arc::clone(&self.ctx.connector);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(target).await;
            let _ = tx.send(SessionEvent::BackendConnected(result));
        });
    }

    pub(super) fn on_backend_connected(&mut self, result: Result<BackLink, BackendError>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                self.disconnect_backend_error(e);
                return;
            }
        };
        let Some(profile) = self.profile.clone() else {
            link.sender.close();
            self.disconnect(DisconnectKind::Internal, "no backend profile");
            return;
        };

        let remote = &self.ctx.config.remote;
        let server_address = self
            .login
            .as_ref()
            .and_then(|l| l.client_data.server_address.as_deref());
        let host = intention_host(&remote.address, server_address, remote.forward_host) + &self.handshake_suffix;

        let sent = link
            .sender
            .send(&BackPacket::ClientIntention {
                protocol_version: BACK_CODEC.version,
                host,
                port: remote.port,
                next_state: INTENTION_LOGIN,
            })
            .and_then(|_| {
                link.sender.send(&BackPacket::LoginStart {
                    name: profile.name.clone(),
                    uuid: profile.uuid,
                })
            });
        if let Err(e) = sent {
            self.disconnect_backend_error(e);
            return;
        }

        tracing::debug!("[connect] [backend_login] session={} name={}", self.id, profile.name);
        self.back = Some(link.sender);
        self.pending_back_rx = Some(link.inbound);
        self.back_state = BackState::Login;
        self.saw_encryption_request = false;
        self.tick.enabled = true;
    }

    fn disconnect_backend_error(&mut self, error: BackendError) {
        match error {
            BackendError::AuthTypeMismatch => {
                let message = self.ctx.messages.get(lang::AUTH_TYPE_MISMATCH).to_string();
                self.disconnect_with_message(DisconnectKind::AuthenticationFailed, message);
            }
            BackendError::Unreachable(_) | BackendError::TimedOut | BackendError::LinkClosed => {
                self.disconnect(DisconnectKind::BackendUnreachable, error.to_string());
            }
            BackendError::Rejected(reason) => self.disconnect(DisconnectKind::Kicked, reason),
            BackendError::Crypto(e) => self.disconnect(DisconnectKind::Internal, e.to_string()),
        }
    }

    pub fn handle_back_inbound(&mut self, inbound: BackInbound) {
        if self.closed {
            return;
        }
        match inbound {
            BackInbound::Frame(body) => match back::decode(self.back_state, Direction::Clientbound, &body) {
                Ok(packet) => self.handle_back_packet(packet),
                Err(e) => tracing::debug!("[connect] [back_decode_skipped] session={} error={}", self.id, e),
            },
            BackInbound::Closed(detail) => {
                self.back = None;
                self.pending_back_rx = None;
                match self.back_state {
                    BackState::Handshake | BackState::Login => {
                        let error = classify_login_close(self.saw_encryption_request, detail.as_deref());
                        self.disconnect_backend_error(error);
                    }
                    BackState::Play => {
                        let detail = detail.unwrap_or_else(|| "connection closed".to_string());
                        self.disconnect(DisconnectKind::Kicked, detail);
                    }
                }
            }
        }
    }

    fn handle_back_packet(&mut self, packet: BackPacket) {
        match packet {
            BackPacket::LoginSuccess { uuid, name } => {
                tracing::info!(
                    "[connect] [backend_joined] session={} name={} uuid={}",
                    self.id,
                    name,
                    uuid
                );
                self.profile = Some(BackendProfile { name, uuid });
                self.back_state = BackState::Play;
                self.state = ConnectionState::ConnectedToBackend;
                self.logging_in = false;
            }
            BackPacket::EncryptionRequest { .. } => {
                self.saw_encryption_request = true;
                self.disconnect_backend_error(BackendError::AuthTypeMismatch);
            }
            BackPacket::LoginDisconnect { reason } | BackPacket::Disconnect { reason } => {
                self.disconnect(DisconnectKind::Kicked, reason);
            }
            BackPacket::JoinGame {
                entity_id, dimension, ..
            } => {
                self.world.entity_id = entity_id;
                if self.start_game_sent {
                    self.switch_dimension(&dimension);
                    return;
                }

                let workaround = self.ctx.config.bedrock.above_bedrock_nether_building;
                let front_dim = front_dimension(&dimension, workaround);
                let game_version = self.game_version();
                self.send_front(&FrontPacket::StartGame {
                    entity_id: entity_id as i64,
                    runtime_id: self.world.runtime_id,
                    dimension: front_dim,
                    position: self.world.position,
                    world_name: self.ctx.config.bedrock.server_name.clone(),
                    game_version,
                });
                self.send_front(&FrontPacket::PlayStatus {
                    status: PlayStatusKind::PlayerSpawn,
                });
                self.start_game_sent = true;
                self.world.front_dimension = front_dim;
                if workaround && dimension == NETHER {
                    self.send_fog(&[NETHER_FOG]);
                }
                self.world.dimension = dimension;
            }
            BackPacket::Respawn { dimension } => {
                if dimension != self.world.dimension {
                    self.switch_dimension(&dimension);
                }
            }
            BackPacket::KeepAlive { id } => self.send_back(&BackPacket::KeepAliveResponse { id }),
            BackPacket::PlayerPosition {
                x, y, z, yaw, pitch, ..
            } => {
                let position = Vec3::new(x as f32, y as f32, z as f32);
                self.world.position = position;
                self.world.yaw = yaw;
                self.world.pitch = pitch;
                self.tick.last_move = Instant::now();
                self.send_front(&FrontPacket::MovePlayer {
                    runtime_id: self.world.runtime_id,
                    position,
                    pitch,
                    yaw,
                    mode: MOVE_MODE_TELEPORT,
                    on_ground: self.world.on_ground,
                });
                self.schedule_look_back(LOOK_BACK_DELAY, yaw, pitch);
            }
            BackPacket::UpdateMobEffect {
                entity_id,
                effect_id,
                amplifier,
                duration,
            } if entity_id == self.world.entity_id => {
                let Some(effect_id) = front_effect_id(effect_id) else {
                    return;
                };
                let amplifier = amplifier as i32;
                let event = match self.world.effects.insert(effect_id, amplifier) {
                    Some(_) => MOB_EFFECT_MODIFY,
                    None => MOB_EFFECT_ADD,
                };
                self.send_front(&FrontPacket::MobEffect {
                    runtime_id: self.world.runtime_id,
                    event,
                    effect_id,
                    amplifier,
                    duration,
                });
            }
            BackPacket::RemoveMobEffect { entity_id, effect_id } if entity_id == self.world.entity_id => {
                let Some(effect_id) = front_effect_id(effect_id) else {
                    return;
                };
                if self.world.effects.remove(&effect_id).is_some() {
                    self.send_front(&FrontPacket::MobEffect {
                        runtime_id: self.world.runtime_id,
                        event: MOB_EFFECT_REMOVE,
                        effect_id,
                        amplifier: 0,
                        duration: 0,
                    });
                }
            }
            BackPacket::InitializeBorder {
                center_x,
                center_z,
                old_diameter,
                new_diameter,
                speed_ms,
            } => {
                self.tick.border = Some(WorldBorder::new(center_x, center_z, old_diameter, new_diameter, speed_ms));
                self.tick.in_border_warning = false;
            }
            other => self.translate_back(other),
        }
    }
}
