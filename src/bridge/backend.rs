//! Backend leg: connector, link and handshake helpers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::auth::BoxFuture;
use crate::network::crypt::{seal_with_shared_key, CryptoError};
use crate::network::{read_varint_frame, write_varint_frame};
use crate::protocol::back::{self, BackPacket};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Remote server unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out connecting to remote server")]
    TimedOut,

    #[error("Remote server rejected the connection: {0}")]
    Rejected(String),

    #[error("Remote server requires online authentication")]
    AuthTypeMismatch,

    #[error("Backend link closed")]
    LinkClosed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Where and how to reach the backend.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub address: String,
    pub port: u16,
    pub timeout: Duration,
    /// Client address to announce in a PROXY header, when enabled
    pub proxy_source: Option<SocketAddr>,
}

#[derive(Debug)]
pub enum BackOutbound {
    Packet(Bytes),
    Close,
}

#[derive(Debug)]
pub enum BackInbound {
    Frame(Vec<u8>),
    Closed(Option<String>),
}

/// Ordered sender for the backend leg.
#[derive(Debug, Clone)]
pub struct BackSender {
    tx: mpsc::UnboundedSender<BackOutbound>,
}

impl BackSender {
    pub fn new(tx: mpsc::UnboundedSender<BackOutbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, packet: &BackPacket) -> Result<(), BackendError> {
        self.tx
            .send(BackOutbound::Packet(back::encode(packet)))
            .map_err(|_| BackendError::LinkClosed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(BackOutbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established backend connection as seen by the session.
#[derive(Debug)]
pub struct BackLink {
    pub sender: BackSender,
    pub inbound: mpsc::UnboundedReceiver<BackInbound>,
}

impl BackLink {
    /// In-process link; the far ends go to the caller
    pub fn pair() -> (
        BackLink,
        mpsc::UnboundedReceiver<BackOutbound>,
        mpsc::UnboundedSender<BackInbound>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            BackLink {
                sender: BackSender::new(out_tx),
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

pub trait BackendConnector: Send + Sync {
    fn connect(&self, target: BackendTarget) -> BoxFuture<'_, Result<BackLink, BackendError>>;
}

/// PROXY protocol v1 header announcing `source` as the real client.
pub fn proxy_protocol_header(source: SocketAddr, destination: SocketAddr) -> String {
    let family = match (source, destination) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
        (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
        _ => return "PROXY UNKNOWN\r\n".to_string(),
    };
    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port()
    )
}

/// Plain TCP connector.
pub struct TcpConnector;

impl BackendConnector for TcpConnector {
    fn connect(&self, target: BackendTarget) -> BoxFuture<'_, Result<BackLink, BackendError>> {
        Box::pin(async move {
            let addr = format!("{}:{}", target.address, target.port);
            let stream = match tokio::time::timeout(target.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(BackendError::Unreachable(e.to_string())),
                Err(_) => return Err(BackendError::TimedOut),
            };
            let _ = stream.set_nodelay(true);

            let (mut reader, mut writer) = stream.into_split();

            if let Some(source) = target.proxy_source {
                let destination = writer
                    .peer_addr()
                    .map_err(|e| BackendError::Unreachable(e.to_string()))?;
                let header = proxy_protocol_header(source, destination);
                writer
                    .write_all(header.as_bytes())
                    .await
                    .map_err(|e| BackendError::Unreachable(e.to_string()))?;
            }

            let (link, mut out_rx, in_tx) = BackLink::pair();

            tokio::spawn(async move {
                loop {
                    match read_varint_frame(&mut reader).await {
                        Ok(frame) => {
                            if in_tx.send(BackInbound::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = in_tx.send(BackInbound::Closed(Some(e.to_string())));
                            break;
                        }
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(out) = out_rx.recv().await {
                    match out {
                        BackOutbound::Packet(body) => {
                            if let Err(e) = write_varint_frame(&mut writer, &body).await {
                                tracing::debug!("[backend] [write_failed] error={}", e);
                                break;
                            }
                        }
                        BackOutbound::Close => break,
                    }
                }
                let _ = writer.shutdown().await;
            });

            tracing::debug!("[backend] [connected] addr={}", addr);
            Ok(link)
        })
    }
}

/// Fields carried in the forwarded-identity suffix, in wire order.
#[derive(Debug, Clone)]
pub struct ForwardedIdentity {
    pub game_version: String,
    pub display_name: String,
    pub xuid: String,
    pub device_os: i32,
    pub language_code: String,
    pub ui_profile: i32,
    pub input_mode: i32,
    pub client_ip: String,
}

/// Strip an IPv6 zone (`%eth0`) from an address string
pub fn strip_scope(ip: &str) -> &str {
    ip.split_once('%').map(|(addr, _)| addr).unwrap_or(ip)
}

/// `'\0'` + base64 of the sealed, `'\0'`-joined identity fields.
pub fn forwarded_suffix(key: &[u8; 32], identity: &ForwardedIdentity) -> Result<String, BackendError> {
    let joined = [
        identity.game_version.as_str(),
        identity.display_name.as_str(),
        identity.xuid.as_str(),
        &identity.device_os.to_string(),
        identity.language_code.as_str(),
        &identity.ui_profile.to_string(),
        &identity.input_mode.to_string(),
        strip_scope(&identity.client_ip),
    ]
    .join("\0");
    let sealed = seal_with_shared_key(key, joined.as_bytes())?;
    Ok(format!("\0{}", STANDARD.encode(sealed)))
}

/// Host string for the backend handshake: the host the client dialed when
/// forwarding is on, otherwise the configured address.
pub fn intention_host(configured: &str, client_server_address: Option<&str>, forward_host: bool) -> String {
    if forward_host {
        if let Some(addr) = client_server_address {
            let host = match addr.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
                _ => addr,
            };
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }
    configured.to_string()
}

/// Map a backend close during login to the error shown to the player.
pub fn classify_login_close(saw_encryption_request: bool, detail: Option<&str>) -> BackendError {
    if saw_encryption_request {
        return BackendError::AuthTypeMismatch;
    }
    match detail {
        Some(detail) if detail.contains("refused") || detail.contains("reset") => {
            BackendError::Unreachable(detail.to_string())
        }
        Some(detail) => BackendError::Rejected(detail.to_string()),
        None => BackendError::Rejected("connection closed".to_string()),
    }
}

/// Shared connector handle as stored in the proxy context
pub type SharedConnector = Arc<dyn BackendConnector>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::crypt::open_with_shared_key;
    use crate::protocol::back::{BackState, Direction};
    use tokio::net::TcpListener;

    #[test]
    fn test_proxy_header_v4() {
        let src: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:25565".parse().unwrap();
        assert_eq!(
            proxy_protocol_header(src, dst),
            "PROXY TCP4 10.0.0.5 10.0.0.1 40000 25565\r\n"
        );
    }

    #[test]
    fn test_proxy_header_mixed_family() {
        let src: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let dst: SocketAddr = "[::1]:25565".parse().unwrap();
        assert_eq!(proxy_protocol_header(src, dst), "PROXY UNKNOWN\r\n");
    }

    #[test]
    fn test_forwarded_suffix_decrypts() {
        let key = [9u8; 32];
        let suffix = forwarded_suffix(
            &key,
            &ForwardedIdentity {
                game_version: "1.20.10".into(),
                display_name: "Steve".into(),
                xuid: "42".into(),
                device_os: 7,
                language_code: "en_US".into(),
                ui_profile: 0,
                input_mode: 1,
                client_ip: "fe80::1%eth0".into(),
            },
        )
        .unwrap();

        assert!(suffix.starts_with('\0'));
        let sealed = STANDARD.decode(&suffix[1..]).unwrap();
        let plain = open_with_shared_key(&key, &sealed).unwrap();
        let fields: Vec<&str> = std::str::from_utf8(&plain).unwrap().split('\0').collect();
        assert_eq!(fields, vec!["1.20.10", "Steve", "42", "7", "en_US", "0", "1", "fe80::1"]);
    }

    #[test]
    fn test_intention_host() {
        assert_eq!(intention_host("backend.local", Some("play.example.net:19132"), true), "play.example.net");
        assert_eq!(intention_host("backend.local", Some("play.example.net:19132"), false), "backend.local");
        assert_eq!(intention_host("backend.local", None, true), "backend.local");
    }

    #[test]
    fn test_classify_login_close() {
        assert!(matches!(classify_login_close(true, None), BackendError::AuthTypeMismatch));
        assert!(matches!(
            classify_login_close(false, Some("connection reset by peer")),
            BackendError::Unreachable(_)
        ));
        assert!(matches!(classify_login_close(false, Some("banned")), BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_tcp_connector_writes_proxy_header_and_frames() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let target = BackendTarget {
            address: addr.ip().to_string(),
            port: addr.port(),
            timeout: Duration::from_secs(5),
            proxy_source: Some("192.168.1.2:5000".parse().unwrap()),
        };
        let connect = tokio::spawn(async move { TcpConnector.connect(target).await });

        let (mut server, _) = listener.accept().await.unwrap();
        let link = connect.await.unwrap().unwrap();
        link.sender.send(&BackPacket::KeepAliveResponse { id: 1 }).unwrap();

        let mut header = vec![0u8; "PROXY TCP4 192.168.1.2 127.0.0.1 5000 ".len()];
        server.read_exact(&mut header).await.unwrap();
        assert!(std::str::from_utf8(&header).unwrap().starts_with("PROXY TCP4 192.168.1.2 127.0.0.1 5000"));

        // rest of the header line, then the frame
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
        }
        let frame = read_varint_frame(&mut server).await.unwrap();
        assert_eq!(
            back::decode(BackState::Play, Direction::Serverbound, &frame).unwrap(),
            BackPacket::KeepAliveResponse { id: 1 }
        );
    }

    #[tokio::test]
    async fn test_tcp_connector_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector
            .connect(BackendTarget {
                address: addr.ip().to_string(),
                port: addr.port(),
                timeout: Duration::from_secs(5),
                proxy_source: None,
            })
            .await;
        assert!(matches!(result, Err(BackendError::Unreachable(_))));
    }
}
