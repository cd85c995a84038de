//! Listener and process-wide proxy state.

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::bridge::auth::{AuthService, CredentialStore, PendingAuthRegistry, UnavailableAuthService};
use crate::bridge::backend::{SharedConnector, TcpConnector};
use crate::bridge::registry::SessionRegistry;
use crate::bridge::translate::{PacketTranslator, PassthroughTranslator};
use crate::bridge::{run_session, FrontInbound, FrontLink, FrontOutbound, Session, SessionEvent, SessionObserver};
use crate::config::ProxyConfig;
use crate::lang::Messages;
use crate::network::crypt::decode_verifying_key;
use crate::network::{read_frame, write_frame, FrameCodec, Role};
use crate::packs::PackRegistry;
use crate::protocol::codec::CodecRegistry;

/// How long shutdown waits for sessions to say goodbye
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared by every session.
pub struct ProxyContext {
    pub config: ProxyConfig,
    pub messages: Messages,
    pub codecs: CodecRegistry,
    /// Swapped whole on reload; sessions keep the offer they were given
    packs: RwLock<Arc<PackRegistry>>,
    pub sessions: SessionRegistry,
    pub pending_auth: PendingAuthRegistry,
    pub credentials: Mutex<CredentialStore>,
    pub trusted_roots: Vec<VerifyingKey>,
    /// Key sealing forwarded identities
    pub floodgate_key: Option<[u8; 32]>,
    pub auth: Arc<dyn AuthService>,
    pub connector: SharedConnector,
    pub translator: Arc<dyn PacketTranslator>,
    pub observers: Vec<Arc<dyn SessionObserver>>,
    shutting_down: AtomicBool,
    stop: Notify,
    next_session_id: AtomicU64,
}

fn decode_floodgate_key(b64: &str) -> Result<[u8; 32]> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let raw = STANDARD.decode(b64.trim()).context("floodgate_key is not valid base64")?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| anyhow::anyhow!("floodgate_key must be 32 bytes, got {}", raw.len()))
}

impl ProxyContext {
    /// Build from config: decodes keys, loads packs and the credential file.
    pub fn new(config: ProxyConfig, messages: Messages) -> Result<Self> {
        let trusted_roots = config
            .trusted_root_keys
            .iter()
            .map(|k| decode_verifying_key(k).with_context(|| format!("Invalid trusted root key: {}", k)))
            .collect::<Result<Vec<_>>>()?;

        let floodgate_key = config
            .floodgate_key
            .as_deref()
            .map(decode_floodgate_key)
            .transpose()?;

        let packs = PackRegistry::load(&config).context("Failed to load resource packs")?;
        let credentials = CredentialStore::load(&config.credentials_file)?;

        Ok(Self {
            messages,
            codecs: CodecRegistry::new(),
            packs: RwLock::new(Arc::new(packs)),
            sessions: SessionRegistry::new(config.max_players),
            pending_auth: PendingAuthRegistry::new(Duration::from_secs(
                config.pending_authentication_timeout_secs,
            )),
            credentials: Mutex::new(credentials),
            trusted_roots,
            floodgate_key,
            auth: Arc::new(UnavailableAuthService),
            connector: Arc::new(TcpConnector),
            translator: Arc::new(PassthroughTranslator),
            observers: Vec::new(),
            shutting_down: AtomicBool::new(false),
            stop: Notify::new(),
            next_session_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthService>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_connector(mut self, connector: SharedConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn PacketTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_packs(self, packs: PackRegistry) -> Self {
        self.replace_packs(packs);
        self
    }

    /// Current pack registry
    pub fn packs(&self) -> Arc<PackRegistry> {
        Arc::clone(&self.packs.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace_packs(&self, packs: PackRegistry) {
        *self.packs.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(packs);
    }

    /// Reload every configured pack from disk. Sessions that already got an
    /// offer keep it; later logins see the new packs. On failure the
    /// current registry stays in place.
    pub fn reload_packs(&self) -> Result<usize> {
        let packs = PackRegistry::load(&self.config).context("Failed to reload resource packs")?;
        let count = packs.len();
        self.replace_packs(packs);
        tracing::info!("[server] [packs_reloaded] count={}", count);
        Ok(count)
    }

    /// Ask `run` to stop accepting and shut down.
    pub fn request_stop(&self) {
        self.stop.notify_one();
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Mutex::new(credentials);
        self
    }

    pub fn with_floodgate_key(mut self, key: [u8; 32]) -> Self {
        self.floodgate_key = Some(key);
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Refuse new logins and ask every live session to close.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = self.sessions.handles();
        tracing::info!("[server] [shutdown] sessions={}", handles.len());
        for handle in handles {
            handle.execute(SessionEvent::Shutdown);
        }
    }

    /// Accept clients on `bind` until ctrl-c.
    pub async fn run(ctx: Arc<Self>, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Cannot bind {}", bind))?;
        tracing::info!(
            "[server] [ready] addr={} remote={}:{} auth={:?}",
            bind,
            ctx.config.remote.address,
            ctx.config.remote.port,
            ctx.config.remote.auth_type
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("[server] [accept_failed] error={}", e);
                            continue;
                        }
                    };
                    let c = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_new_connection(c, stream, peer).await;
                    });
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = ctx.stop.notified() => break,
            }
        }

        ctx.begin_shutdown();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !ctx.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!("[server] [stopped] remaining={}", ctx.sessions.len());
        Ok(())
    }
}

/// Operator command read from the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    ReloadPacks,
    List,
    Stop,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?.trim_start_matches('/').to_ascii_lowercase();
        Some(match word.as_str() {
            "reloadpacks" | "loadpacks" => Self::ReloadPacks,
            "list" => Self::List,
            "stop" | "exit" => Self::Stop,
            _ => Self::Unknown(word),
        })
    }
}

/// Run one console command and return the reply for the operator.
pub fn execute_console_command(ctx: &ProxyContext, command: ConsoleCommand) -> String {
    match command {
        ConsoleCommand::ReloadPacks => match ctx.reload_packs() {
            Ok(count) => format!("Reloaded {} resource packs", count),
            Err(e) => {
                tracing::warn!("[server] [packs_reload_failed] error={:#}", e);
                format!("Pack reload failed: {:#}", e)
            }
        },
        ConsoleCommand::List => format!("{} of {} players online", ctx.sessions.len(), ctx.config.max_players),
        ConsoleCommand::Stop => {
            ctx.request_stop();
            "Stopping".to_string()
        }
        ConsoleCommand::Unknown(word) => format!("Unknown command: {}", word),
    }
}

/// Read commands line by line until the input closes or `stop` is given.
pub async fn run_console<R: AsyncBufRead + Unpin>(ctx: Arc<ProxyContext>, input: R) {
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("[console] [read_failed] error={}", e);
                break;
            }
        };
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        let stop = command == ConsoleCommand::Stop;
        tracing::info!("[console] {}", execute_console_command(&ctx, command));
        if stop {
            break;
        }
    }
}

/// Run one client connection to completion.
pub async fn handle_new_connection(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr) {
    if ctx.sessions.is_full() {
        tracing::info!("[server] [full] limit={}", ctx.config.max_players);
        return;
    }
    let _ = stream.set_nodelay(true);
    let id = ctx.next_session_id();
    let (mut reader, mut writer) = stream.into_split();

    let (front_tx, front_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(body) => {
                    if front_tx.send(FrontInbound::Frame(body)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = front_tx.send(FrontInbound::Closed(Some(e.to_string())));
                    break;
                }
            }
        }
    });

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                FrontOutbound::Frame(body) => {
                    if let Err(e) = write_frame(&mut writer, &body).await {
                        tracing::debug!("[server] [write_failed] session={} error={}", id, e);
                        break;
                    }
                }
                FrontOutbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let front = FrontLink::new(FrameCodec::new(Role::Server), out_tx);
    let session = Session::new(id, ctx, peer, front, events_tx);
    run_session(session, front_rx, events_rx).await;
}
