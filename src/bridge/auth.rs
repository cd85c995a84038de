//! Backend account authentication
//!
//! The account service itself is an external collaborator (`AuthService`).
//! This module owns what the proxy keeps around it: the process-wide map of
//! in-flight device-code logins keyed by player, and the refresh-token
//! store.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication service unavailable")]
    Unavailable,

    #[error("Refresh token rejected")]
    TokenRejected,

    #[error("Device code expired")]
    CodeExpired,

    #[error("Authentication service error: {0}")]
    Service(String),
}

/// A logged-in backend account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedProfile {
    pub name: String,
    pub uuid: Uuid,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Device-code flow handle as issued by the account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    pub user_code: String,
    pub device_code: String,
    pub verification_uri: String,
    pub interval: Duration,
    pub expires_in: Duration,
}

/// Account service used for online backend logins.
pub trait AuthService: Send + Sync {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'_, Result<AuthenticatedProfile, AuthError>>;

    fn request_device_code(&self) -> BoxFuture<'_, Result<DeviceCode, AuthError>>;

    /// `Ok(None)` while the player has not finished yet
    fn poll_device_code(&self, code: DeviceCode) -> BoxFuture<'_, Result<Option<AuthenticatedProfile>, AuthError>>;
}

/// Default service: every call fails.
pub struct UnavailableAuthService;

impl AuthService for UnavailableAuthService {
    fn refresh(&self, _refresh_token: String) -> BoxFuture<'_, Result<AuthenticatedProfile, AuthError>> {
        Box::pin(async { Err(AuthError::Unavailable) })
    }

    fn request_device_code(&self) -> BoxFuture<'_, Result<DeviceCode, AuthError>> {
        Box::pin(async { Err(AuthError::Unavailable) })
    }

    fn poll_device_code(&self, _code: DeviceCode) -> BoxFuture<'_, Result<Option<AuthenticatedProfile>, AuthError>> {
        Box::pin(async { Err(AuthError::Unavailable) })
    }
}

/// Name-derived id the backend assigns to offline players.
pub fn offline_uuid(name: &str) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(format!("OfflinePlayer:{}", name).as_bytes());
    uuid::Builder::from_md5_bytes(hasher.finalize().into()).into_uuid()
}

/// Id used for forwarded-identity players, derived from their numeric id.
pub fn forwarded_uuid(xuid: &str) -> Uuid {
    let xuid = xuid.parse::<u64>().unwrap_or(0);
    Uuid::from_u64_pair(0, xuid)
}

// ============================================
// Pending device-code logins
// ============================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthTaskState {
    Starting,
    CodeIssued(DeviceCode),
    Completed(Result<AuthenticatedProfile, AuthError>),
}

/// One in-flight device-code login.
///
/// Not owned by any session: a player may disconnect and reconnect while
/// the login is still resolving, and the new session picks the same task
/// back up. `online` tracks whether some session is currently watching.
pub struct AuthTask {
    key: String,
    online: AtomicBool,
    touched: Mutex<Instant>,
    state: watch::Sender<AuthTaskState>,
}

impl AuthTask {
    fn new(key: &str) -> Self {
        let (state, _) = watch::channel(AuthTaskState::Starting);
        Self {
            key: key.to_string(),
            online: AtomicBool::new(true),
            touched: Mutex::new(Instant::now()),
            state,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        self.reset_timer();
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn reset_timer(&self) {
        *self.touched.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.touched.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }

    pub fn state(&self) -> AuthTaskState {
        self.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.state.borrow(), AuthTaskState::Completed(_))
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthTaskState> {
        self.state.subscribe()
    }

    pub fn publish(&self, state: AuthTaskState) {
        self.state.send_replace(state);
    }

    /// Drive the device-code flow to completion.
    pub async fn drive(self: Arc<Self>, service: Arc<dyn AuthService>) {
        let code = match service.request_device_code().await {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!("[auth] [device_code_failed] key={} error={}", self.key, e);
                self.publish(AuthTaskState::Completed(Err(e)));
                return;
            }
        };
        tracing::info!("[auth] [device_code_issued] key={} uri={}", self.key, code.verification_uri);
        self.publish(AuthTaskState::CodeIssued(code.clone()));

        let started = Instant::now();
        loop {
            tokio::time::sleep(code.interval).await;
            if started.elapsed() >= code.expires_in {
                self.publish(AuthTaskState::Completed(Err(AuthError::CodeExpired)));
                return;
            }
            match service.poll_device_code(code.clone()).await {
                Ok(Some(profile)) => {
                    tracing::info!("[auth] [device_code_complete] key={} name={}", self.key, profile.name);
                    self.publish(AuthTaskState::Completed(Ok(profile)));
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    self.publish(AuthTaskState::Completed(Err(e)));
                    return;
                }
            }
        }
    }
}

/// In-flight device-code logins, keyed by stable player id.
pub struct PendingAuthRegistry {
    tasks: Mutex<HashMap<String, Arc<AuthTask>>>,
    timeout: Duration,
}

impl PendingAuthRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Existing task for `key`, if any
    pub fn get(&self, key: &str) -> Option<Arc<AuthTask>> {
        self.cleanup();
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.get(key).cloned()
    }

    /// Existing task for `key`, or a fresh one. The bool is true when the
    /// task was just created and still needs a driver.
    pub fn get_or_create(&self, key: &str) -> (Arc<AuthTask>, bool) {
        self.cleanup();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.get(key) {
            task.set_online(true);
            return (Arc::clone(task), false);
        }
        let task = Arc::new(AuthTask::new(key));
        tasks.insert(key.to_string(), Arc::clone(&task));
        (task, true)
    }

    pub fn remove(&self, key: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop tasks nobody has watched for longer than the timeout.
    pub fn cleanup(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let timeout = self.timeout;
        tasks.retain(|key, task| {
            let keep = task.is_online() || task.idle_for() < timeout;
            if !keep {
                tracing::debug!("[auth] [task_expired] key={}", key);
            }
            keep
        });
    }
}

// ============================================
// Refresh-token store
// ============================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(default)]
    tokens: HashMap<String, String>,
}

/// YAML file of player name -> refresh token.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    tokens: HashMap<String, String>,
}

impl CredentialStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref().to_path_buf();
        let tokens = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                serde_yaml::from_str::<StoredTokens>(&contents)
                    .with_context(|| format!("Failed to parse credentials in {}", path.display()))?
                    .tokens
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read credentials: {}", path.display())))
            }
        };
        Ok(Self { path, tokens })
    }

    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            tokens: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    /// Remember `token` for `name` and write the file back.
    pub fn store(&mut self, name: &str, token: &str) -> anyhow::Result<()> {
        use anyhow::Context;

        self.tokens.insert(name.to_string(), token.to_string());
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&StoredTokens {
            tokens: self.tokens.clone(),
        })
        .context("Failed to serialize credentials")?;
        std::fs::write(&self.path, yaml)
            .with_context(|| format!("Failed to write credentials to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_uuid_is_name_based_v3() {
        let a = offline_uuid("Steve");
        assert_eq!(a, offline_uuid("Steve"));
        assert_ne!(a, offline_uuid("Alex"));
        assert_eq!(a.get_version_num(), 3);
    }

    #[test]
    fn test_forwarded_uuid_from_xuid() {
        let id = forwarded_uuid("2535400000000001");
        assert_eq!(id.as_u64_pair(), (0, 2535400000000001));
    }

    #[test]
    fn test_task_reused_across_reconnects() {
        let registry = PendingAuthRegistry::new(Duration::from_secs(120));
        let (first, created) = registry.get_or_create("123");
        assert!(created);
        first.set_online(false);

        let (second, created) = registry.get_or_create("123");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.is_online());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_offline_tasks_expire() {
        let registry = PendingAuthRegistry::new(Duration::ZERO);
        let (task, _) = registry.get_or_create("123");
        registry.cleanup();
        assert_eq!(registry.len(), 1, "online tasks are kept");

        task.set_online(false);
        registry.cleanup();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_service_completes_with_error() {
        let registry = PendingAuthRegistry::new(Duration::from_secs(120));
        let (task, _) = registry.get_or_create("123");
        let mut rx = task.subscribe();
        Arc::clone(&task).drive(Arc::new(UnavailableAuthService)).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), AuthTaskState::Completed(Err(AuthError::Unavailable)));
        assert!(task.is_done());
    }

    #[test]
    fn test_credential_store_round_trip() {
        let path = std::env::temp_dir().join("crossplay_test_tokens.yaml");
        let _ = std::fs::remove_file(&path);

        let mut store = CredentialStore::load(&path).unwrap();
        assert!(store.get("Steve").is_none());
        store.store("Steve", "refresh-1").unwrap();

        let reloaded = CredentialStore::load(&path).unwrap();
        assert_eq!(reloaded.get("Steve"), Some("refresh-1"));

        let _ = std::fs::remove_file(path);
    }
}
