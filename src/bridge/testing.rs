//! Fixtures for driving a `Session` from tests without sockets.
//!
//! `TestSession` plays the client: it encodes through its own frame codec
//! and follows the server's compression and encryption switches.

use ed25519_dalek::SigningKey;
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::auth::{
    offline_uuid, AuthError, AuthService, AuthenticatedProfile, BoxFuture, CredentialStore, DeviceCode,
};
use super::backend::{BackInbound, BackLink, BackOutbound, BackendConnector, BackendError, BackendTarget};
use super::dimension::OVERWORLD;
use super::{
    DisconnectKind, DisconnectReason, FrontLink, FrontOutbound, Session, SessionEvent, SessionObserver,
    SessionSummary,
};
use crate::config::{CompressionScheme, ProxyConfig};
use crate::lang::Messages;
use crate::network::crypt::{client_key_exchange, encode_token, encode_verifying_key, generate_signing_key};
use crate::network::{FrameCodec, Role};
use crate::protocol::back::{self, BackPacket, BackState, Direction};
use crate::protocol::codec::DEFAULT_PROTOCOL_VERSION;
use crate::protocol::front::{self, FrontPacket, PackResponseStatus};
use crate::server::ProxyContext;

thread_local! {
    // connector installed by the last `context_with` on this test's thread
    static LAST_CONNECTOR: RefCell<Option<MockConnector>> = const { RefCell::new(None) };
}

pub fn offline_config() -> ProxyConfig {
    ProxyConfig::from_str(
        r#"
remote:
  address: "127.0.0.1"
  auth_type: offline
online_mode: false
"#,
    )
    .unwrap()
}

/// Context with in-memory credentials and a `MockConnector`; `build` may
/// override anything.
pub fn context_with(config: ProxyConfig, build: impl FnOnce(ProxyContext) -> ProxyContext) -> Arc<ProxyContext> {
    let connector = MockConnector::default();
    LAST_CONNECTOR.with(|c| *c.borrow_mut() = Some(connector.clone()));
    let ctx = ProxyContext::new(config, Messages::default())
        .unwrap()
        .with_credentials(CredentialStore::in_memory())
        .with_connector(Arc::new(connector));
    Arc::new(build(ctx))
}

pub fn offline_context() -> Arc<ProxyContext> {
    context_with(offline_config(), |ctx| ctx)
}

/// Online mode with a trusted root no test client signs with.
pub fn online_context() -> Arc<ProxyContext> {
    let mut config = offline_config();
    config.online_mode = true;
    config.trusted_root_keys = vec![encode_verifying_key(&generate_signing_key().verifying_key())];
    context_with(config, |ctx| ctx)
}

// ============================================
// Collaborator doubles
// ============================================

type FarEnds = (mpsc::UnboundedReceiver<BackOutbound>, mpsc::UnboundedSender<BackInbound>);

#[derive(Default)]
struct MockState {
    attempts: usize,
    fail: Option<BackendError>,
    ends: VecDeque<FarEnds>,
}

/// In-process backend; keeps the far ends of every link it hands out.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// First attempt fails with `error`
    pub fn failing(error: BackendError) -> Self {
        let connector = Self::default();
        connector.state.lock().unwrap().fail = Some(error);
        connector
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    fn take_ends(&self) -> Option<FarEnds> {
        self.state.lock().unwrap().ends.pop_front()
    }
}

impl BackendConnector for MockConnector {
    fn connect(&self, _target: BackendTarget) -> BoxFuture<'_, Result<BackLink, BackendError>> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(error) = state.fail.take() {
            return Box::pin(async move { Err(error) });
        }
        let (link, out_rx, in_tx) = BackLink::pair();
        state.ends.push_back((out_rx, in_tx));
        Box::pin(async move { Ok(link) })
    }
}

/// Account service that finishes every flow as one fixed account.
pub struct MockAuthService {
    profile: AuthenticatedProfile,
}

impl MockAuthService {
    pub fn completing(name: &str) -> Self {
        Self {
            profile: AuthenticatedProfile {
                name: name.to_string(),
                uuid: Uuid::from_u128(7),
                access_token: "access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
            },
        }
    }
}

impl AuthService for MockAuthService {
    fn refresh(&self, _refresh_token: String) -> BoxFuture<'_, Result<AuthenticatedProfile, AuthError>> {
        let profile = self.profile.clone();
        Box::pin(async move { Ok(profile) })
    }

    fn request_device_code(&self) -> BoxFuture<'_, Result<DeviceCode, AuthError>> {
        Box::pin(async {
            Ok(DeviceCode {
                user_code: "ABCD".to_string(),
                device_code: "dc".to_string(),
                verification_uri: "https://example.invalid/link".to_string(),
                interval: Duration::from_millis(1),
                expires_in: Duration::from_secs(60),
            })
        })
    }

    fn poll_device_code(&self, _code: DeviceCode) -> BoxFuture<'_, Result<Option<AuthenticatedProfile>, AuthError>> {
        let profile = self.profile.clone();
        Box::pin(async move { Ok(Some(profile)) })
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<DisconnectKind>>,
}

impl RecordingObserver {
    pub fn kinds(&self) -> Vec<DisconnectKind> {
        self.seen.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_disconnect(&self, _summary: &SessionSummary, reason: &DisconnectReason) {
        self.seen.lock().unwrap().push(reason.kind);
    }
}

// ============================================
// Login tokens
// ============================================

/// Two-link identity chain: `root` vouches for `identity`, which carries the claims.
pub fn identity_chain(root: &SigningKey, identity: &SigningKey, name: &str, xuid: &str) -> String {
    let identity_pub = encode_verifying_key(&identity.verifying_key());
    let first = encode_token(root, &json!({ "identityPublicKey": identity_pub })).unwrap();
    let last = encode_token(
        identity,
        &json!({
            "identityPublicKey": identity_pub,
            "extraData": {
                "displayName": name,
                "identity": Uuid::new_v4().to_string(),
                "XUID": xuid,
            },
        }),
    )
    .unwrap();
    json!({ "chain": [first, last] }).to_string()
}

pub fn client_data_token(identity: &SigningKey) -> String {
    encode_token(
        identity,
        &json!({
            "GameVersion": "1.20.10",
            "LanguageCode": "en_US",
            "DeviceOS": 7,
            "ServerAddress": "play.example.net:19132",
            "DeviceId": "device-1",
            "UIProfile": 0,
            "CurrentInputMode": 1,
        }),
    )
    .unwrap()
}

/// Chain and client data signed by a throwaway root.
pub fn login_payload(name: &str, xuid: &str) -> (String, String) {
    let root = generate_signing_key();
    let identity = generate_signing_key();
    (identity_chain(&root, &identity, name, xuid), client_data_token(&identity))
}

// ============================================
// TestSession
// ============================================

pub struct TestSession {
    pub session: Session,
    pub front_rx: mpsc::UnboundedReceiver<FrontOutbound>,
    pub events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    client: FrameCodec,
    identity: SigningKey,
    front_closed: bool,
    connector: Option<MockConnector>,
    back_out: Option<mpsc::UnboundedReceiver<BackOutbound>>,
    back_in: Option<mpsc::UnboundedSender<BackInbound>>,
}

pub async fn new_session(ctx: Arc<ProxyContext>) -> TestSession {
    let (out_tx, front_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    let id = ctx.next_session_id();
    let front = FrontLink::new(FrameCodec::new(Role::Server), out_tx);
    let mut session = Session::new(id, ctx, peer, front, events_tx);
    session.start();

    TestSession {
        session,
        front_rx,
        events_rx,
        client: FrameCodec::new(Role::Client),
        identity: generate_signing_key(),
        front_closed: false,
        connector: LAST_CONNECTOR.with(|c| c.borrow().clone()),
        back_out: None,
        back_in: None,
    }
}

/// Offline player, backend in play state, client spawned; all output drained.
pub async fn spawned_session() -> TestSession {
    let mut t = new_session(offline_context()).await;
    t.negotiate(DEFAULT_PROTOCOL_VERSION);
    t.login("Steve", "2535400000000001");
    t.complete_packs();
    t.settle().await;

    t.push_back(&BackPacket::LoginSuccess {
        uuid: offline_uuid("Steve"),
        name: "Steve".to_string(),
    });
    t.push_back(&BackPacket::JoinGame {
        entity_id: 7,
        dimension: OVERWORLD.to_string(),
        game_mode: 0,
    });
    t.send(&FrontPacket::SetLocalPlayerAsInitialized { runtime_id: 1 });

    t.recv_all();
    t.drain_back();
    assert!(!t.session.logging_in);
    t
}

impl TestSession {
    /// Encode as the client would and hand the frame to the session.
    pub fn send(&mut self, packet: &FrontPacket) {
        let body = front::encode(self.session.front.codec().map(|c| c.as_ref()), packet);
        let frame = self.client.encode(&body).unwrap();
        self.session.handle_front_frame(&frame);
    }

    /// Everything the session queued for the client, decoded.
    pub fn recv_all(&mut self) -> Vec<FrontPacket> {
        let mut packets = Vec::new();
        while let Ok(out) = self.front_rx.try_recv() {
            let frame = match out {
                FrontOutbound::Frame(frame) => frame,
                FrontOutbound::Close => {
                    self.front_closed = true;
                    continue;
                }
            };
            let plain = self.client.decode(&frame).unwrap();
            let packet = front::decode(self.session.front.codec().map(|c| c.as_ref()), &plain).unwrap();
            match &packet {
                FrontPacket::NetworkSettings {
                    compression_algorithm, ..
                } => {
                    if let Some(scheme) = CompressionScheme::from_wire_id(*compression_algorithm) {
                        self.client.enable_compression(scheme);
                    }
                }
                FrontPacket::ServerToClientHandshake { token } => {
                    let key = client_key_exchange(&self.identity, token, chrono::Utc::now().timestamp()).unwrap();
                    self.client.enable_encryption(&key);
                }
                _ => {}
            }
            packets.push(packet);
        }
        packets
    }

    pub fn negotiate(&mut self, protocol_version: u32) {
        self.send(&FrontPacket::RequestNetworkSettings { protocol_version });
        self.recv_all();
    }

    /// Send a login signed by a throwaway root; output is left queued.
    pub fn login(&mut self, name: &str, xuid: &str) {
        let root = generate_signing_key();
        let chain_data = identity_chain(&root, &self.identity, name, xuid);
        let client_data = client_data_token(&self.identity);
        let protocol_version = self
            .session
            .front
            .codec()
            .map(|c| c.version())
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        self.send(&FrontPacket::Login {
            protocol_version,
            chain_data,
            client_data,
        });
    }

    /// Accept the offered packs without downloading any.
    pub fn complete_packs(&mut self) {
        self.recv_all();
        self.send(&FrontPacket::ResourcePackClientResponse {
            status: PackResponseStatus::HaveAllPacks,
            pack_ids: Vec::new(),
        });
        self.recv_all();
        self.send(&FrontPacket::ResourcePackClientResponse {
            status: PackResponseStatus::Completed,
            pack_ids: Vec::new(),
        });
    }

    /// Let spawned work run, then feed its events to the session.
    pub async fn settle(&mut self) {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            while let Ok(event) = self.events_rx.try_recv() {
                self.session.handle_event(event);
            }
        }
    }

    pub fn reasons(&self) -> Vec<DisconnectKind> {
        self.session.close_reason().map(|r| r.kind).into_iter().collect()
    }

    pub fn closed_front(&mut self) -> bool {
        while let Ok(out) = self.front_rx.try_recv() {
            if out == FrontOutbound::Close {
                self.front_closed = true;
            }
        }
        self.front_closed
    }

    pub fn connect_attempts(&self) -> usize {
        self.connector.as_ref().map(MockConnector::attempts).unwrap_or(0)
    }

    fn attach_backend(&mut self) {
        if self.back_out.is_some() || self.back_in.is_some() {
            return;
        }
        if let Some((out_rx, in_tx)) = self.connector.as_ref().and_then(MockConnector::take_ends) {
            self.back_out = Some(out_rx);
            self.back_in = Some(in_tx);
        }
    }

    /// Deliver a backend packet as if it came off the link.
    pub fn push_back(&mut self, packet: &BackPacket) {
        self.attach_backend();
        self.session
            .handle_back_inbound(BackInbound::Frame(back::encode(packet).to_vec()));
    }

    /// Next packet the session sent to the backend, decoded for `state`.
    pub fn next_back_packet_in(&mut self, state: BackState) -> Option<BackPacket> {
        self.attach_backend();
        let out = self.back_out.as_mut()?;
        loop {
            match out.try_recv() {
                Ok(BackOutbound::Packet(body)) => {
                    return Some(back::decode(state, Direction::Serverbound, &body).unwrap())
                }
                Ok(BackOutbound::Close) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn next_back_packet(&mut self) -> Option<BackPacket> {
        let state = self.session.back_state;
        self.next_back_packet_in(state)
    }

    fn drain_back(&mut self) {
        self.attach_backend();
        if let Some(out) = self.back_out.as_mut() {
            while out.try_recv().is_ok() {}
        }
    }

    /// True once the session closed its end of the backend link.
    pub fn backend_closed(&mut self) -> bool {
        self.attach_backend();
        let Some(out) = self.back_out.as_mut() else {
            return false;
        };
        loop {
            match out.try_recv() {
                Ok(BackOutbound::Close) => return true,
                Ok(BackOutbound::Packet(_)) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    /// Drop the far end so further backend sends fail.
    pub fn drop_backend(&mut self) {
        self.attach_backend();
        self.back_out = None;
    }
}
