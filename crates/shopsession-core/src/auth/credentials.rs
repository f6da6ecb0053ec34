use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

use crate::config::Deployment;

const SERVICE_NAME: &str = "shopsession";

/// An opaque bearer credential.
///
/// The client never decodes it; it only reacts to the server's 401.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Wrap a raw credential. Empty input means "absent".
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

/// The access/refresh credential pair held for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: Option<Token>,
    pub refresh: Option<Token>,
}

impl CredentialPair {
    pub fn new(access: Token, refresh: Token) -> Self {
        Self {
            access: Some(access),
            refresh: Some(refresh),
        }
    }

    /// Build a pair from raw strings, dropping empty values.
    pub fn from_raw(access: Option<String>, refresh: Option<String>) -> Self {
        Self {
            access: access.and_then(Token::new),
            refresh: refresh.and_then(Token::new),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }
}

/// Durable storage behind the [`CredentialStore`](super::CredentialStore).
///
/// Implementations must treat removing absent credentials as success.
pub trait CredentialBackend: Send + Sync {
    fn load(&self) -> Result<Option<CredentialPair>>;
    fn save(&self, pair: &CredentialPair) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCredentials {
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
    saved_at: DateTime<Utc>,
}

/// One JSON file per deployment in the cache directory.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(cache_dir: PathBuf, deployment: Deployment) -> Self {
        Self {
            path: cache_dir.join(format!("session-{}.json", deployment)),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CredentialBackend for FileBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credential file")?;
        let persisted: PersistedCredentials = serde_json::from_str(&contents)
            .context("Failed to parse credential file")?;
        let pair = CredentialPair::from_raw(persisted.access, persisted.refresh);
        Ok((!pair.is_empty()).then_some(pair))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedCredentials {
            access: pair.access.as_ref().map(|t| t.as_str().to_string()),
            refresh: pair.refresh.as_ref().map(|t| t.as_str().to_string()),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, contents).context("Failed to write credential file")?;
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential file"),
        }
    }
}

/// OS keychain entries, one per storage key (`access`, `admin_refresh`, ...).
///
/// Durable only when keyring is built with a platform store (the workspace
/// enables the macOS, Windows and Secret Service backends). Elsewhere keyring
/// falls back to its in-memory mock and nothing survives a restart.
pub struct KeyringBackend {
    service: String,
    deployment: Deployment,
}

impl KeyringBackend {
    pub fn new(deployment: Deployment) -> Self {
        Self::with_service(SERVICE_NAME, deployment)
    }

    /// Entries under a service name other than the default.
    pub fn with_service(service: impl Into<String>, deployment: Deployment) -> Self {
        Self {
            service: service.into(),
            deployment,
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn write(&self, key: &str, token: Option<&Token>) -> Result<()> {
        match token {
            Some(token) => self
                .entry(key)?
                .set_password(token.as_str())
                .context("Failed to store credential in keychain"),
            None => self.delete(key),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

impl CredentialBackend for KeyringBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        let access = self.read(self.deployment.access_key())?;
        let refresh = self.read(self.deployment.refresh_key())?;
        let pair = CredentialPair::from_raw(access, refresh);
        Ok((!pair.is_empty()).then_some(pair))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        self.write(self.deployment.refresh_key(), pair.refresh.as_ref())?;
        self.write(self.deployment.access_key(), pair.access.as_ref())
    }

    fn remove(&self) -> Result<()> {
        self.delete(self.deployment.access_key())?;
        self.delete(self.deployment.refresh_key())
    }
}

/// Process-local storage with no durability.
#[derive(Default)]
pub struct MemoryBackend {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with credentials already present, as if restored from a previous run.
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        let guard = self.pair.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        *self.pair.lock().unwrap_or_else(|e| e.into_inner()) = Some(pair.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.pair.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
