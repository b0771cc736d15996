//! Durable credential storage.
//!
//! Three values survive a restart: the refresh token, the username and the
//! (possibly stale) access token. They are kept under fixed key names in a
//! [`CredentialStore`], normally the OS keychain.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;

use crate::config::APP_NAME;

/// Credentials file name in the config directory
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    RefreshToken,
    Username,
    AccessToken,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 3] = [
        CredentialKey::RefreshToken,
        CredentialKey::Username,
        CredentialKey::AccessToken,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::RefreshToken => "refresh_token",
            CredentialKey::Username => "username",
            CredentialKey::AccessToken => "access_token",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Credential store failure: {0}")]
    Backend(String),
}

/// Asynchronous key-value store for durable credentials.
/// Removing a key that is not present succeeds.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: CredentialKey) -> Result<(), StoreError>;
}

// ============================================================================
// OS keychain
// ============================================================================

/// Stores each credential as its own keychain entry under one service name.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(APP_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(service: &str, key: CredentialKey) -> Result<Entry, StoreError> {
        Ok(Entry::new(service, key.as_str())?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keychain IPC and file I/O block, keep them off the async workers
async fn blocking<T, F>(task: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StoreError::Backend(format!("Credential store task failed: {}", e)))?
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        let service = self.service.clone();
        blocking(move || match Self::entry(&service, key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        let service = self.service.clone();
        let value = value.to_string();
        blocking(move || Ok(Self::entry(&service, key)?.set_password(&value)?)).await
    }

    async fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        let service = self.service.clone();
        blocking(move || match Self::entry(&service, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

// ============================================================================
// JSON file
// ============================================================================

/// Credentials in a JSON object on disk, for hosts without a keychain.
/// Writes are serialized so concurrent `set`/`remove` calls don't lose updates.
pub struct FileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `~/.config/keyward/credentials.json`
    pub fn default_location() -> Result<Self, StoreError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| StoreError::Backend("Could not find config directory".to_string()))?;
        Ok(Self::new(config_dir.join(APP_NAME).join(CREDENTIALS_FILE)))
    }

    fn read_map(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_map(path: &Path, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if map.is_empty() {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(map)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        blocking(move || Ok(Self::read_map(&path)?.remove(key.as_str()))).await
    }

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let value = value.to_string();
        blocking(move || {
            let mut map = Self::read_map(&path)?;
            map.insert(key.as_str().to_string(), value);
            Self::write_map(&path, &map)
        })
        .await
    }

    async fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut map = Self::read_map(&path)?;
            if map.remove(key.as_str()).is_some() {
                Self::write_map(&path, &map)?;
            }
            Ok(())
        })
        .await
    }
}

// ============================================================================
// In-process
// ============================================================================

/// In-memory store. Read and write failures can be switched on to exercise
/// store error handling, and writes can be slowed down to open race windows.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<CredentialKey, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Duration,
    removals: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (CredentialKey, V)>,
        V: Into<String>,
    {
        let store = Self::new();
        store
            .lock()
            .extend(values.into_iter().map(|(k, v)| (k, v.into())));
        store
    }

    /// Every `set` sleeps for `delay` before writing
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Number of `remove` calls that reached the store
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Synchronous peek at a stored value
    pub fn value(&self, key: CredentialKey) -> Option<String> {
        self.lock().get(&key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CredentialKey, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, flag: &AtomicBool, op: &str, key: CredentialKey) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("{} of {} failed", op, key)));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: CredentialKey) -> Result<Option<String>, StoreError> {
        self.check(&self.fail_reads, "read", key)?;
        Ok(self.lock().get(&key).cloned())
    }

    async fn set(&self, key: CredentialKey, value: &str) -> Result<(), StoreError> {
        self.check(&self.fail_writes, "write", key)?;
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.lock().insert(key, value.to_string());
        Ok(())
    }

    async fn remove(&self, key: CredentialKey) -> Result<(), StoreError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.check(&self.fail_writes, "remove", key)?;
        self.lock().remove(&key);
        Ok(())
    }
}
