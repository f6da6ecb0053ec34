use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ExpiredHook, SessionEvent, SessionEvents};
use super::state::{spawn_state_publisher, SessionState};
use crate::api::{ApiError, ApiRequest, AuthenticatedClient};
use crate::auth::{
    spawn_refresh_timer, CredentialBackend, CredentialStore, FileBackend, KeyringBackend,
    RefreshCoordinator, Token,
};
use crate::config::{Config, StorageKind};

/// Builds a [`SessionManager`]. `build` must run inside a tokio runtime
/// because it starts the publisher and timer tasks.
pub struct SessionManagerBuilder {
    config: Config,
    backend: Option<Box<dyn CredentialBackend>>,
    client: Option<Client>,
    on_expired: Option<ExpiredHook>,
}

impl SessionManagerBuilder {
    /// Use `backend` instead of the one selected by `config.storage`.
    pub fn backend(mut self, backend: Box<dyn CredentialBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Called once per forced logout with the reason, so the host can
    /// navigate back to its entry page.
    pub fn on_session_expired<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_expired = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<SessionManager> {
        let config = self.config;
        let backend: Box<dyn CredentialBackend> = match self.backend {
            Some(backend) => backend,
            None => match config.storage {
                StorageKind::File => Box::new(FileBackend::new(config.cache_dir()?, config.deployment)),
                StorageKind::Keyring => Box::new(KeyringBackend::new(config.deployment)),
            },
        };
        let store = CredentialStore::open(backend).context("Failed to open credential store")?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(config.request_timeout())
                .build()
                .context("Failed to build HTTP client")?,
        };

        let events = SessionEvents::new(self.on_expired);
        let coordinator = RefreshCoordinator::new(
            client.clone(),
            config.refresh_url(),
            store.clone(),
            events.clone(),
            config.refresh_timeout(),
        );
        let api = AuthenticatedClient::new(
            client,
            config.api_url.clone(),
            store.clone(),
            coordinator.clone(),
            events.clone(),
        );

        let shutdown = CancellationToken::new();
        let (state_rx, publisher) = spawn_state_publisher(
            api.clone(),
            store.clone(),
            config.identity_path.clone(),
            shutdown.child_token(),
        );
        let mut tasks = vec![publisher];
        if let Some(period) = config.refresh_interval() {
            tasks.push(spawn_refresh_timer(
                coordinator.clone(),
                store.clone(),
                period,
                shutdown.child_token(),
            ));
        }

        info!(deployment = %config.deployment, api_url = %config.api_url, "Session manager started");
        Ok(SessionManager {
            config,
            store,
            coordinator,
            api,
            events,
            state_rx,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

/// One logical session per deployment: credential store, refresh
/// coordinator, request wrapper, state publisher and passive timer.
pub struct SessionManager {
    config: Config,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
    api: AuthenticatedClient,
    events: SessionEvents,
    state_rx: watch::Receiver<SessionState>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn builder(config: Config) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            backend: None,
            client: None,
            on_expired: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Log in with a username and password.
    ///
    /// Returns `Ok(false)` when the server rejects the credentials, or when
    /// an admin session is requested for a non-staff identity. Nothing is
    /// stored in either case.
    pub async fn login(&self, username: &str, password: &str) -> Result<bool, ApiError> {
        let Some(pair) = self
            .api
            .obtain_pair(&self.config.token_path, username, password)
            .await?
        else {
            info!(username = username, "Login rejected");
            return Ok(false);
        };

        if self.config.deployment.requires_staff() {
            let access = pair.access.as_ref().ok_or(ApiError::NoAccessCredential)?;
            let identity = self.api.identity_for(&self.config.identity_path, access).await?;
            if !identity.is_staff {
                warn!(username = username, "Admin login refused for non-staff account");
                return Ok(false);
            }
        }

        self.store.set(pair)?;
        info!(username = username, deployment = %self.config.deployment, "Logged in");
        self.events.emit(SessionEvent::LoggedIn {
            username: username.to_string(),
        });
        Ok(true)
    }

    /// Forget the session. Logging out twice is not an error.
    pub fn logout(&self) -> Result<(), ApiError> {
        let was_logged_in = self.store.get().is_some();
        self.store.clear()?;
        if was_logged_in {
            info!(deployment = %self.config.deployment, "Logged out");
            self.events.emit(SessionEvent::LoggedOut);
        } else {
            debug!("Logout with no session");
        }
        Ok(())
    }

    /// The latest derived session state.
    pub fn session_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that is notified on every session state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn authenticated_request(
        &self,
        endpoint: &str,
        request: &ApiRequest,
    ) -> Result<Response, ApiError> {
        self.api.request(endpoint, request).await
    }

    /// The stored access credential, without contacting the server.
    pub fn access_token(&self) -> Result<Token, ApiError> {
        self.store.access().ok_or(ApiError::NoAccessCredential)
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.api
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Stop the publisher and timer and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
