//! Session Bridge
//!
//! One `Session` per connected client, owned by a single task. Reads from
//! the front transport, the backend link, the tick timer and the session's
//! own event queue are all funnelled through `run_session`, so no two
//! handlers for the same session ever run at once.

pub mod assets;
pub mod auth;
pub mod backend;
pub mod connect;
pub mod dimension;
pub mod forms;
pub mod handshake;
pub mod registry;
pub mod session;
pub mod tick;
pub mod translate;

#[cfg(test)]
pub(crate) mod testing;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use crate::lang;
use crate::network::{FrameCodec, FrameError};
use crate::protocol::codec::CodecDescriptor;
use crate::protocol::front::{self, FrontPacket};

pub use session::Session;

/// Tick period
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitingSettingsRequest,
    AwaitingLogin,
    KeyExchange,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHandshake(HandshakeStage),
    AwaitingAssetTransfer,
    AuthenticatingBackend,
    ConnectedToBackend,
    Spawned,
    Closed,
}

impl ConnectionState {
    /// Gameplay packets are only meaningful from here on
    pub fn is_post_handshake(self) -> bool {
        !matches!(
            self,
            ConnectionState::Connecting | ConnectionState::AwaitingHandshake(_) | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    OutdatedClient,
    OutdatedServer,
    ShuttingDown,
    AuthenticationFailed,
    BackendUnreachable,
    ProtocolViolation,
    ResourcePackRefused,
    ClientQuit,
    Kicked,
    Internal,
}

impl DisconnectKind {
    /// Message key in the lang table
    pub fn message_key(self) -> &'static str {
        match self {
            DisconnectKind::OutdatedClient => lang::OUTDATED_CLIENT,
            DisconnectKind::OutdatedServer => lang::OUTDATED_SERVER,
            DisconnectKind::ShuttingDown => lang::SHUTTING_DOWN,
            DisconnectKind::AuthenticationFailed => lang::AUTH_FAILED,
            DisconnectKind::BackendUnreachable => lang::BACKEND_UNREACHABLE,
            DisconnectKind::ProtocolViolation => lang::PROTOCOL_VIOLATION,
            DisconnectKind::ResourcePackRefused => lang::PACK_REFUSED,
            DisconnectKind::ClientQuit => lang::CLIENT_QUIT,
            DisconnectKind::Kicked => lang::KICKED,
            DisconnectKind::Internal => lang::INTERNAL,
        }
    }
}

/// Final reason a session closed, as shown to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub kind: DisconnectKind,
    pub message: String,
}

/// What observers learn about a closed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: u64,
    pub peer: SocketAddr,
    pub display_name: Option<String>,
    pub xuid: Option<String>,
    pub last_state: ConnectionState,
}

/// Notified once per session when it closes.
pub trait SessionObserver: Send + Sync {
    fn on_disconnect(&self, summary: &SessionSummary, reason: &DisconnectReason);
}

/// Work handed to the session's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontOutbound {
    Frame(Bytes),
    Close,
}

/// What the reader task hands to the session loop.
#[derive(Debug)]
pub enum FrontInbound {
    Frame(Vec<u8>),
    Closed(Option<String>),
}

/// Units of work marshalled into a session's loop from elsewhere.
#[derive(Debug)]
pub enum SessionEvent {
    BackendConnected(Result<backend::BackLink, backend::BackendError>),
    AuthProgress(auth::AuthTaskState),
    RefreshFinished(Result<auth::AuthenticatedProfile, auth::AuthError>),
    Emotes(Vec<String>),
    LookBack,
    Kick(String),
    Shutdown,
}

/// The session's front leg: bound codec, frame pipeline and writer queue.
pub struct FrontLink {
    codec: Option<Arc<CodecDescriptor>>,
    frame: FrameCodec,
    tx: mpsc::UnboundedSender<FrontOutbound>,
}

impl FrontLink {
    pub fn new(frame: FrameCodec, tx: mpsc::UnboundedSender<FrontOutbound>) -> Self {
        Self { codec: None, frame, tx }
    }

    pub fn codec(&self) -> Option<&Arc<CodecDescriptor>> {
        self.codec.as_ref()
    }

    /// Bind the negotiated codec. A codec is bound at most once.
    pub fn bind_codec(&mut self, codec: Arc<CodecDescriptor>) -> bool {
        if self.codec.is_some() {
            return false;
        }
        self.codec = Some(codec);
        true
    }

    pub fn frame_mut(&mut self) -> &mut FrameCodec {
        &mut self.frame
    }

    /// Encode and queue. Order of calls is order on the wire.
    pub fn send(&mut self, packet: &FrontPacket) -> Result<(), FrameError> {
        let body = front::encode(self.codec.as_deref(), packet);
        let frame = self.frame.encode(&body)?;
        if self.tx.send(FrontOutbound::Frame(frame)).is_err() {
            tracing::debug!("[bridge] [front_send_dropped] packet={}", packet.name());
        }
        Ok(())
    }

    pub fn close(&mut self) {
        let _ = self.tx.send(FrontOutbound::Close);
    }

    pub fn decode(&mut self, body: &[u8]) -> Result<FrontPacket, DecodeFailure> {
        let plain = self.frame.decode(body).map_err(DecodeFailure::Frame)?;
        front::decode(self.codec.as_deref(), &plain).map_err(DecodeFailure::Packet)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeFailure {
    #[error(transparent)]
    Frame(FrameError),

    #[error(transparent)]
    Packet(crate::protocol::DecodeError),
}

async fn next_back(rx: &mut Option<mpsc::UnboundedReceiver<backend::BackInbound>>) -> backend::BackInbound {
    match rx {
        Some(rx) => rx
            .recv()
            .await
            .unwrap_or(backend::BackInbound::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drive one session until it closes.
pub async fn run_session(
    mut session: Session,
    mut front_rx: mpsc::UnboundedReceiver<FrontInbound>,
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    session.start();

    let mut back_rx: Option<mpsc::UnboundedReceiver<backend::BackInbound>> = None;
    let mut ticker: Option<Interval> = None;

    loop {
        tokio::select! {
            inbound = front_rx.recv() => match inbound {
                Some(FrontInbound::Frame(body)) => session.handle_front_frame(&body),
                Some(FrontInbound::Closed(err)) => {
                    session.disconnect(DisconnectKind::ClientQuit, err.unwrap_or_default());
                }
                None => session.disconnect(DisconnectKind::ClientQuit, ""),
            },
            Some(event) = events_rx.recv() => session.handle_event(event),
            inbound = next_back(&mut back_rx) => session.handle_back_inbound(inbound),
            _ = next_tick(&mut ticker) => session.run_tick(),
        }

        if session.is_closed() {
            break;
        }

        if let Some(rx) = session.take_back_receiver() {
            back_rx = Some(rx);
        }
        if !session.has_backend() {
            back_rx = None;
        }

        match (session.tick_active(), ticker.is_some()) {
            (true, false) => {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker = Some(interval);
            }
            (false, true) => ticker = None,
            _ => {}
        }
    }

    tracing::debug!(
        "[bridge] [loop_exit] session={} kind={:?}",
        session.id(),
        session.close_reason().map(|r| r.kind)
    );
}
