//! Derived session state.
//!
//! The publisher task watches the credential store's access credential and
//! re-derives [`SessionState`] on every change, fetching the identity through
//! the request wrapper. It is the convergence point after an unrecoverable
//! credential failure: a 401 that survives the wrapper's retry ends the
//! session, so no stale identity is ever published.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, AuthenticatedClient};
use crate::auth::CredentialStore;

/// The authenticated user as reported by the identity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Identity {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(tag = "state", content = "identity", rename_all = "snake_case")]
pub enum SessionState {
    /// No credentials.
    #[default]
    Anonymous,
    /// Credentials present, identity fetch pending or failed.
    Unresolved,
    Authenticated(Identity),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

/// Start the publisher. The returned receiver always holds the latest state.
pub fn spawn_state_publisher(
    client: AuthenticatedClient,
    store: CredentialStore,
    identity_endpoint: String,
    shutdown: CancellationToken,
) -> (watch::Receiver<SessionState>, JoinHandle<()>) {
    let mut changes = store.subscribe();
    let initial = if changes.borrow().is_some() {
        SessionState::Unresolved
    } else {
        SessionState::Anonymous
    };
    let (state_tx, state_rx) = watch::channel(initial);

    let handle = tokio::spawn(async move {
        loop {
            let has_access = changes.borrow_and_update().is_some();
            let next = if has_access {
                state_tx.send_if_modified(|state| {
                    if matches!(state, SessionState::Anonymous) {
                        *state = SessionState::Unresolved;
                        true
                    } else {
                        false
                    }
                });
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = resolve(&client, &identity_endpoint) => next,
                }
            } else {
                SessionState::Anonymous
            };

            // A newer credential arrived while fetching; this result is stale.
            if !changes.has_changed().unwrap_or(false) {
                publish(&state_tx, next);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Session state publisher stopped");
    });

    (state_rx, handle)
}

fn publish(state_tx: &watch::Sender<SessionState>, next: SessionState) {
    state_tx.send_if_modified(|state| {
        if *state == next {
            false
        } else {
            debug!(from = ?state, to = ?next, "Session state changed");
            *state = next;
            true
        }
    });
}

async fn resolve(client: &AuthenticatedClient, identity_endpoint: &str) -> SessionState {
    let response = match client.request(identity_endpoint, &ApiRequest::get()).await {
        Ok(response) => response,
        Err(e) if e.is_session_lost() => {
            debug!(error = %e, "Session ended while fetching identity");
            return SessionState::Anonymous;
        }
        Err(e) => {
            warn!(error = %e, "Identity fetch failed");
            return SessionState::Unresolved;
        }
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        // Rejected even with a freshly refreshed credential.
        client.force_logout("identity rejected after refresh");
        return SessionState::Anonymous;
    }
    if !status.is_success() {
        warn!(status = status.as_u16(), "Identity fetch returned an error status");
        return SessionState::Unresolved;
    }

    match response.json::<Identity>().await {
        Ok(identity) => {
            info!(username = %identity.username, "Session authenticated");
            SessionState::Authenticated(identity)
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse identity");
            SessionState::Unresolved
        }
    }
}
