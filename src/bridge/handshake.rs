//! Handshake Controller
//!
//! settings request -> login -> key exchange -> authenticated. Any failure
//! closes the session with a reason; nothing is retried.

use ed25519_dalek::VerifyingKey;
use serde::Deserialize;

use super::registry::{RegistryError, SessionHandle};
use super::{ConnectionState, DisconnectKind, HandshakeStage, Session};
use crate::lang;
use crate::network::compression::COMPRESSION_THRESHOLD;
use crate::network::crypt::{server_key_exchange, verify_chain, verify_token, CryptoError};
use crate::protocol::codec::VersionMatch;
use crate::protocol::front::{FrontPacket, PlayStatusKind};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Malformed login payload: {0}")]
    MalformedLogin(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Identity chain is not signed by a trusted authority")]
    Unsigned,

    #[error("Client data was not signed by the identity key")]
    ClientDataSignature,

    #[error("Missing identity claim: {0}")]
    MissingClaim(&'static str),
}

/// Who the client says it is, taken from the last chain link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    /// Stable id (UUID string)
    pub identity: String,
    pub xuid: String,
    /// Chain rooted in a trusted key
    pub signed: bool,
}

fn default_language() -> String {
    "en_US".to_string()
}

/// Claims of the client-data token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientData {
    #[serde(rename = "GameVersion", default)]
    pub game_version: String,

    #[serde(rename = "LanguageCode", default = "default_language")]
    pub language_code: String,

    #[serde(rename = "DeviceOS", default)]
    pub device_os: i32,

    #[serde(rename = "ServerAddress", default)]
    pub server_address: Option<String>,

    #[serde(rename = "DeviceId", default)]
    pub device_id: String,

    #[serde(rename = "UIProfile", default)]
    pub ui_profile: i32,

    #[serde(rename = "CurrentInputMode", default)]
    pub current_input_mode: i32,
}

/// Verified result of a login packet.
#[derive(Debug, Clone)]
pub struct LoginIdentity {
    pub identity: Identity,
    pub client_data: ClientData,
    pub identity_key: VerifyingKey,
}

#[derive(Deserialize)]
struct ChainData {
    chain: Vec<String>,
}

fn claim(extra: &serde_json::Value, name: &'static str) -> Result<String, HandshakeError> {
    extra
        .get(name)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(HandshakeError::MissingClaim(name))
}

/// Check the identity chain and the client-data token of a login packet.
pub fn verify_login(
    chain_data: &str,
    client_data: &str,
    trusted_roots: &[VerifyingKey],
    require_signed: bool,
    now: i64,
) -> Result<LoginIdentity, HandshakeError> {
    let chain: ChainData = serde_json::from_str(chain_data)?;
    let verified = verify_chain(&chain.chain, trusted_roots, now)?;
    if require_signed && !verified.signed {
        return Err(HandshakeError::Unsigned);
    }

    let payload = verify_token(client_data, &verified.identity_key, now).map_err(|e| match e {
        CryptoError::BadSignature => HandshakeError::ClientDataSignature,
        other => HandshakeError::Crypto(other),
    })?;
    let client_data: ClientData = serde_json::from_value(payload)?;

    let identity = Identity {
        display_name: claim(&verified.extra_data, "displayName")?,
        identity: claim(&verified.extra_data, "identity")?,
        xuid: claim(&verified.extra_data, "XUID").unwrap_or_default(),
        signed: verified.signed,
    };

    Ok(LoginIdentity {
        identity,
        client_data,
        identity_key: verified.identity_key,
    })
}

impl Session {
    pub(super) fn handle_settings_request(&mut self, protocol_version: u32) {
        if self.state != ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingSettingsRequest)
            || self.front.codec().is_some()
        {
            self.disconnect(DisconnectKind::ProtocolViolation, "network settings requested twice");
            return;
        }

        let codecs = &self.ctx.codecs;
        let newest = codecs.default_descriptor().display_name();
        match codecs.classify(protocol_version) {
            VersionMatch::ClientTooNew => {
                tracing::debug!(
                    "[handshake] [client_too_new] session={} version={} supported={}",
                    self.id,
                    protocol_version,
                    codecs.describe_supported().join(", ")
                );
                self.disconnect(DisconnectKind::OutdatedServer, newest);
            }
            VersionMatch::ClientTooOld => {
                tracing::debug!(
                    "[handshake] [client_too_old] session={} version={} supported={}",
                    self.id,
                    protocol_version,
                    codecs.describe_supported().join(", ")
                );
                self.disconnect(DisconnectKind::OutdatedClient, newest);
            }
            VersionMatch::Supported(codec) => {
                tracing::debug!(
                    "[handshake] [codec_bound] session={} version={} name={}",
                    self.id,
                    codec.version(),
                    codec.display_name()
                );
                self.front.bind_codec(codec);

                let scheme = self.ctx.config.bedrock.compression;
                self.send_front(&FrontPacket::NetworkSettings {
                    compression_threshold: COMPRESSION_THRESHOLD,
                    compression_algorithm: scheme.wire_id(),
                });
                self.front.frame_mut().enable_compression(scheme);
                self.state = ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingLogin);
            }
        }
    }

    pub(super) fn handle_login(&mut self, protocol_version: u32, chain_data: &str, client_data: &str) {
        match self.state {
            ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingLogin) => {}
            ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingSettingsRequest) => {
                let newest = self.ctx.codecs.default_descriptor().display_name();
                self.disconnect(DisconnectKind::OutdatedClient, newest);
                return;
            }
            _ => {
                self.disconnect(DisconnectKind::ProtocolViolation, "unexpected login");
                return;
            }
        }

        if self.ctx.is_shutting_down() {
            self.disconnect(DisconnectKind::ShuttingDown, "");
            return;
        }

        let negotiated = self.front.codec().map(|c| c.version());
        if negotiated != Some(protocol_version) {
            self.disconnect(
                DisconnectKind::ProtocolViolation,
                format!("login announced protocol {}", protocol_version),
            );
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let login = match verify_login(
            chain_data,
            client_data,
            &self.ctx.trusted_roots,
            self.ctx.config.online_mode,
            now,
        ) {
            Ok(login) => login,
            Err(e) => {
                self.disconnect(DisconnectKind::AuthenticationFailed, e.to_string());
                return;
            }
        };

        self.state = ConnectionState::AwaitingHandshake(HandshakeStage::KeyExchange);
        let exchange = match server_key_exchange(&login.identity_key) {
            Ok(exchange) => exchange,
            Err(e) => {
                self.disconnect(DisconnectKind::AuthenticationFailed, e.to_string());
                return;
            }
        };
        self.send_front(&FrontPacket::ServerToClientHandshake { token: exchange.token });
        self.front.frame_mut().enable_encryption(&exchange.key);

        tracing::info!(
            "[handshake] [authenticated] session={} name={} xuid={} signed={} version={}",
            self.id,
            login.identity.display_name,
            login.identity.xuid,
            login.identity.signed,
            protocol_version
        );
        self.login = Some(login);
        self.state = ConnectionState::AwaitingHandshake(HandshakeStage::Authenticated);
        self.on_authenticated();
    }

    fn on_authenticated(&mut self) {
        self.send_front(&FrontPacket::PlayStatus {
            status: PlayStatusKind::LoginSuccess,
        });

        let name = self.display_name().unwrap_or_default().to_string();
        let handle = SessionHandle::new(self.id, name, self.events_tx.clone());
        match self.ctx.sessions.insert(handle) {
            Ok(()) => self.registered = true,
            Err(RegistryError::Full(limit)) => {
                tracing::debug!("[handshake] [registry_full] session={} limit={}", self.id, limit);
                let message = self.ctx.messages.get(lang::SERVER_FULL).to_string();
                self.disconnect_with_message(DisconnectKind::Kicked, message);
                return;
            }
            Err(e) => {
                self.disconnect(DisconnectKind::Internal, e.to_string());
                return;
            }
        }

        self.begin_asset_transfer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{self, client_data_token, identity_chain, new_session, TestSession};
    use crate::bridge::FrontOutbound;
    use crate::network::crypt::generate_signing_key;
    use crate::protocol::front::FrontPacket;

    #[test]
    fn test_verify_login_signed_chain() {
        let root = generate_signing_key();
        let identity = generate_signing_key();
        let chain = identity_chain(&root, &identity, "Steve", "2535400000000001");
        let data = client_data_token(&identity);

        let login = verify_login(&chain, &data, &[root.verifying_key()], true, 0).unwrap();
        assert_eq!(login.identity.display_name, "Steve");
        assert_eq!(login.identity.xuid, "2535400000000001");
        assert!(login.identity.signed);
        assert_eq!(login.client_data.game_version, "1.20.10");
        assert_eq!(login.client_data.language_code, "en_US");
    }

    #[test]
    fn test_unsigned_chain_policy() {
        let root = generate_signing_key();
        let identity = generate_signing_key();
        let chain = identity_chain(&root, &identity, "Steve", "1");
        let data = client_data_token(&identity);

        // root not trusted
        assert!(matches!(
            verify_login(&chain, &data, &[], true, 0),
            Err(HandshakeError::Unsigned)
        ));
        let login = verify_login(&chain, &data, &[], false, 0).unwrap();
        assert!(!login.identity.signed);
    }

    #[test]
    fn test_client_data_must_match_identity_key() {
        let root = generate_signing_key();
        let identity = generate_signing_key();
        let other = generate_signing_key();
        let chain = identity_chain(&root, &identity, "Steve", "1");
        let data = client_data_token(&other);

        assert!(matches!(
            verify_login(&chain, &data, &[root.verifying_key()], true, 0),
            Err(HandshakeError::ClientDataSignature)
        ));
    }

    #[test]
    fn test_malformed_chain_json() {
        assert!(matches!(
            verify_login("not json", "", &[], false, 0),
            Err(HandshakeError::MalformedLogin(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_response_and_compression() {
        let mut t: TestSession = new_session(testing::offline_context()).await;
        t.send(&FrontPacket::RequestNetworkSettings { protocol_version: 594 });

        let sent = t.recv_all();
        assert_eq!(
            sent,
            vec![FrontPacket::NetworkSettings {
                compression_threshold: 512,
                compression_algorithm: 0,
            }]
        );
        assert_eq!(t.session.front.codec().map(|c| c.version()), Some(594));
        assert!(t.session.front.frame_mut().is_compressed());
        assert_eq!(
            t.session.state,
            ConnectionState::AwaitingHandshake(HandshakeStage::AwaitingLogin)
        );
    }

    #[tokio::test]
    async fn test_version_too_new_disconnects_without_settings() {
        let mut t = new_session(testing::offline_context()).await;
        t.send(&FrontPacket::RequestNetworkSettings { protocol_version: 999 });

        let sent = t.recv_all();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            FrontPacket::Disconnect { message, .. } => assert!(message.contains("Outdated proxy")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.closed_front());
        assert_eq!(t.reasons(), vec![DisconnectKind::OutdatedServer]);
    }

    #[tokio::test]
    async fn test_version_too_old() {
        let mut t = new_session(testing::offline_context()).await;
        t.send(&FrontPacket::RequestNetworkSettings { protocol_version: 400 });
        assert_eq!(t.reasons(), vec![DisconnectKind::OutdatedClient]);
    }

    #[tokio::test]
    async fn test_settings_twice_is_violation() {
        let mut t = new_session(testing::offline_context()).await;
        t.send(&FrontPacket::RequestNetworkSettings { protocol_version: 594 });
        t.send(&FrontPacket::RequestNetworkSettings { protocol_version: 594 });
        assert_eq!(t.reasons(), vec![DisconnectKind::ProtocolViolation]);
    }

    #[tokio::test]
    async fn test_login_before_settings_is_outdated_client() {
        let mut t = new_session(testing::offline_context()).await;
        let (chain, data) = testing::login_payload("Steve", "1");
        t.send(&FrontPacket::Login {
            protocol_version: 594,
            chain_data: chain,
            client_data: data,
        });
        assert_eq!(t.reasons(), vec![DisconnectKind::OutdatedClient]);
    }

    #[tokio::test]
    async fn test_garbage_before_settings_is_outdated_client() {
        let mut t = new_session(testing::offline_context()).await;
        // login id with a truncated body
        t.session.handle_front_frame(&[0x00, 0x01, 0xFF]);
        assert_eq!(t.reasons(), vec![DisconnectKind::OutdatedClient]);
    }

    #[tokio::test]
    async fn test_full_handshake_encrypts_and_offers() {
        let mut t = new_session(testing::offline_context()).await;
        t.negotiate(594);
        t.login("Steve", "2535400000000001");

        let sent = t.recv_all();
        let names: Vec<String> = sent.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["ServerToClientHandshake", "PlayStatus", "ResourcePacksInfo"]);
        assert!(t.session.front.frame_mut().is_encrypted());
        assert_eq!(t.session.state, ConnectionState::AwaitingAssetTransfer);
        assert_eq!(t.session.ctx.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_untrusted_chain_rejected_in_online_mode() {
        let mut t = new_session(testing::online_context()).await;
        t.negotiate(594);
        // signed by a random root, not the configured one
        let (chain, data) = testing::login_payload("Steve", "1");
        t.send(&FrontPacket::Login {
            protocol_version: 594,
            chain_data: chain,
            client_data: data,
        });
        assert_eq!(t.reasons(), vec![DisconnectKind::AuthenticationFailed]);
        assert!(!t.session.front.frame_mut().is_encrypted());
    }

    #[tokio::test]
    async fn test_login_while_shutting_down() {
        let ctx = testing::offline_context();
        ctx.begin_shutdown();
        let mut t = new_session(ctx).await;
        t.negotiate(594);
        t.login("Steve", "1");
        assert_eq!(t.reasons(), vec![DisconnectKind::ShuttingDown]);
    }

    #[tokio::test]
    async fn test_protocol_mismatch_between_settings_and_login() {
        let mut t = new_session(testing::offline_context()).await;
        t.negotiate(594);
        let (chain, data) = testing::login_payload("Steve", "1");
        t.send(&FrontPacket::Login {
            protocol_version: 589,
            chain_data: chain,
            client_data: data,
        });
        assert_eq!(t.reasons(), vec![DisconnectKind::ProtocolViolation]);
        assert!(matches!(t.front_rx.try_recv(), Ok(FrontOutbound::Frame(_))));
    }
}
