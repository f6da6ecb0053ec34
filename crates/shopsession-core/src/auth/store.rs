use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::credentials::{CredentialBackend, CredentialPair, Token};
use crate::api::ApiError;

/// Holds the current credential pair for one deployment.
///
/// Reads come from an in-process snapshot, so `set` and `clear` are visible to
/// every later `get` immediately. Writes go through to the backend. Changes to
/// the access credential are published on a watch channel; the store does not
/// know who listens.
///
/// Clone is cheap and every clone shares the same snapshot.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Box<dyn CredentialBackend>,
    current: Mutex<Option<CredentialPair>>,
    access_tx: watch::Sender<Option<Token>>,
}

impl CredentialStore {
    /// Open the store, restoring whatever the backend persisted.
    pub fn open(backend: Box<dyn CredentialBackend>) -> anyhow::Result<Self> {
        let restored = backend.load()?.filter(|pair| !pair.is_empty());
        debug!(
            has_access = restored.as_ref().is_some_and(|p| p.access.is_some()),
            has_refresh = restored.as_ref().is_some_and(|p| p.refresh.is_some()),
            "Credential store opened"
        );
        let access = restored.as_ref().and_then(|p| p.access.clone());
        let (access_tx, _) = watch::channel(access);
        Ok(Self {
            inner: Arc::new(StoreInner {
                backend,
                current: Mutex::new(restored),
                access_tx,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<CredentialPair>> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Option<CredentialPair> {
        self.lock().clone()
    }

    pub fn access(&self) -> Option<Token> {
        self.lock().as_ref().and_then(|p| p.access.clone())
    }

    pub fn refresh(&self) -> Option<Token> {
        self.lock().as_ref().and_then(|p| p.refresh.clone())
    }

    /// Replace the stored pair. An empty pair clears the store.
    ///
    /// The snapshot is updated even if persisting fails; the persistence
    /// error is still returned.
    pub fn set(&self, pair: CredentialPair) -> Result<(), ApiError> {
        if pair.is_empty() {
            return self.clear();
        }
        let mut current = self.lock();
        let access = pair.access.clone();
        let persisted = self.inner.backend.save(&pair);
        *current = Some(pair);
        self.publish(access);
        drop(current);
        persisted.map_err(|e| {
            warn!(error = %e, "Failed to persist credentials");
            ApiError::Storage(e)
        })
    }

    /// Remove both credentials. Clearing an empty store is not an error.
    pub fn clear(&self) -> Result<(), ApiError> {
        let mut current = self.lock();
        let removed = self.inner.backend.remove();
        *current = None;
        self.publish(None);
        drop(current);
        removed.map_err(|e| {
            warn!(error = %e, "Failed to remove persisted credentials");
            ApiError::Storage(e)
        })
    }

    /// `set`, but only while the stored refresh credential is still
    /// `expected`. Returns whether the pair was stored. The check and the
    /// write happen under one lock, so a concurrent `clear` is never undone.
    pub fn set_if_refresh(&self, expected: &Token, pair: CredentialPair) -> Result<bool, ApiError> {
        let mut current = self.lock();
        if !holds_refresh(&current, expected) {
            return Ok(false);
        }
        if pair.is_empty() {
            drop(current);
            return self.clear().map(|()| true);
        }
        let access = pair.access.clone();
        let persisted = self.inner.backend.save(&pair);
        *current = Some(pair);
        self.publish(access);
        drop(current);
        persisted.map(|()| true).map_err(|e| {
            warn!(error = %e, "Failed to persist credentials");
            ApiError::Storage(e)
        })
    }

    /// `clear`, but only while the stored refresh credential is still
    /// `expected`. Returns whether the store was cleared.
    pub fn clear_if_refresh(&self, expected: &Token) -> Result<bool, ApiError> {
        let mut current = self.lock();
        if !holds_refresh(&current, expected) {
            return Ok(false);
        }
        let removed = self.inner.backend.remove();
        *current = None;
        self.publish(None);
        drop(current);
        removed.map(|()| true).map_err(|e| {
            warn!(error = %e, "Failed to remove persisted credentials");
            ApiError::Storage(e)
        })
    }

    /// Watch the access credential. The receiver sees every change made by
    /// `set` and `clear`; writes that leave it unchanged are not signalled.
    pub fn subscribe(&self) -> watch::Receiver<Option<Token>> {
        self.inner.access_tx.subscribe()
    }

    fn publish(&self, access: Option<Token>) {
        self.inner.access_tx.send_if_modified(|current| {
            if *current == access {
                false
            } else {
                *current = access;
                true
            }
        });
    }
}

fn holds_refresh(current: &Option<CredentialPair>, expected: &Token) -> bool {
    current
        .as_ref()
        .and_then(|p| p.refresh.as_ref())
        .is_some_and(|r| r == expected)
}
