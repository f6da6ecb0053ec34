//! Coordinated refresh of the access credential.
//!
//! However many requests discover an expired access credential at the same
//! time, exactly one `POST token/refresh/` is made per expiry episode. The
//! first caller starts the operation; everyone else awaits the same shared
//! outcome.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credentials::{CredentialPair, Token};
use super::store::CredentialStore;
use crate::api::{ApiError, RefreshFailure};
use crate::session::{SessionEvent, SessionEvents};

type RefreshOutcome = Result<Token, RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// What a caller should wait on after asking for a refresh.
enum Ticket {
    /// Another operation already replaced the rejected credential.
    Current(Token),
    Pending(SharedRefresh),
}

/// Owns the single outstanding refresh operation for one session.
///
/// Clone is cheap; clones share the outstanding marker.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    client: Client,
    refresh_url: String,
    store: CredentialStore,
    events: SessionEvents,
    timeout: Option<Duration>,
    outstanding: Mutex<Option<SharedRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        refresh_url: impl Into<String>,
        store: CredentialStore,
        events: SessionEvents,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                client,
                refresh_url: refresh_url.into(),
                store,
                events,
                timeout,
                outstanding: Mutex::new(None),
            }),
        }
    }

    /// Refresh the access credential, joining any operation already in flight.
    ///
    /// Fails with [`ApiError::NoRefreshCredential`] without a remote call when
    /// the store has nothing to refresh with.
    pub async fn refresh(&self) -> Result<Token, ApiError> {
        match self.ticket(None)? {
            Ticket::Current(token) => Ok(token),
            Ticket::Pending(op) => op.await.map_err(ApiError::from),
        }
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// If no operation is in flight and the store already holds a different
    /// access credential, an earlier refresh has replaced the rejected one and
    /// it is returned without another remote call.
    pub async fn refresh_after_rejection(&self, rejected: &Token) -> Result<Token, ApiError> {
        match self.ticket(Some(rejected))? {
            Ticket::Current(token) => Ok(token),
            Ticket::Pending(op) => op.await.map_err(ApiError::from),
        }
    }

    /// True while a refresh call is outstanding. Diagnostic only: the
    /// answer can be stale as soon as it is returned.
    pub fn is_refreshing(&self) -> bool {
        self.lock_outstanding().is_some()
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, Option<SharedRefresh>> {
        self.inner.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join or start an operation. The marker is checked and set under one
    /// lock that is never held across an await.
    fn ticket(&self, rejected: Option<&Token>) -> Result<Ticket, ApiError> {
        let mut outstanding = self.lock_outstanding();
        if let Some(op) = outstanding.as_ref() {
            debug!("Joining outstanding token refresh");
            return Ok(Ticket::Pending(op.clone()));
        }

        if let Some(rejected) = rejected {
            if let Some(current) = self.inner.store.access() {
                if &current != rejected {
                    debug!("Access credential already refreshed, skipping refresh call");
                    return Ok(Ticket::Current(current));
                }
            }
        }

        let refresh = self
            .inner
            .store
            .refresh()
            .ok_or(ApiError::NoRefreshCredential)?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = inner.perform(&refresh).await;
            inner.settle(&refresh, &outcome);
            outcome
        });
        let op = async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshFailure::Unreachable(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        debug!("Starting coordinated token refresh");
        *outstanding = Some(op.clone());
        Ok(Ticket::Pending(op))
    }
}

impl CoordinatorInner {
    async fn perform(&self, refresh: &Token) -> RefreshOutcome {
        let call = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                refresh: refresh.as_str(),
            })
            .send();

        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RefreshFailure::TimedOut(limit))?,
            None => call.await,
        }
        .map_err(|e| RefreshFailure::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshFailure::Rejected(status.as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;

        let access = Token::new(body.access)
            .ok_or_else(|| RefreshFailure::Malformed("empty access credential".to_string()))?;
        let rotated = body.refresh.and_then(Token::new);
        if !self.store_refreshed(refresh, &access, rotated) {
            return Err(RefreshFailure::SessionEnded);
        }
        Ok(access)
    }

    /// Store the refreshed pair. Returns false, storing nothing, when the
    /// session this refresh belonged to was logged out or replaced while the
    /// call was in flight.
    fn store_refreshed(&self, used: &Token, access: &Token, rotated: Option<Token>) -> bool {
        let was_rotated = rotated.is_some();
        // Rotation invalidates the credential we just used.
        let refresh = rotated.unwrap_or_else(|| used.clone());
        match self
            .store
            .set_if_refresh(used, CredentialPair::new(access.clone(), refresh))
        {
            Ok(false) => {
                info!("Session changed during refresh, discarding refreshed credentials");
                return false;
            }
            Ok(true) => {}
            // The snapshot holds the new pair even when persisting failed.
            Err(e) => warn!(error = %e, "Refreshed credentials could not be persisted"),
        }
        info!(rotated = was_rotated, "Access credential refreshed");
        self.events.emit(SessionEvent::Refreshed {
            rotated: was_rotated,
        });
        true
    }

    /// Apply a failed outcome, then clear the outstanding marker so the next
    /// expiry episode starts a fresh operation. The store is always updated
    /// before the marker is cleared.
    fn settle(&self, used: &Token, outcome: &RefreshOutcome) {
        match outcome {
            Ok(_) => {}
            Err(RefreshFailure::SessionEnded) => {
                debug!("Refresh outcome dropped, session ended while it was in flight");
            }
            Err(failure) => match self.store.clear_if_refresh(used) {
                Ok(false) => {
                    debug!(error = %failure, "Refresh failed for a session that already ended");
                }
                cleared => {
                    warn!(error = %failure, "Token refresh failed, ending session");
                    if let Err(e) = cleared {
                        warn!(error = %e, "Failed to clear credentials after refresh failure");
                    }
                    self.events.refresh_failed(failure);
                }
            },
        }
        *self.outstanding.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
