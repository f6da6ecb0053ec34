use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::api::RefreshFailure;

/// Capacity of the session event channel. Slow subscribers lag rather than
/// block the session.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { username: String },
    LoggedOut,
    /// A coordinated refresh stored a new access credential.
    Refreshed { rotated: bool },
    /// The session was torn down by the core (forced logout).
    Expired { reason: String },
}

/// Called once per forced logout, so the host can navigate to its entry page.
pub type ExpiredHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Fan-out point for [`SessionEvent`]s plus the optional expiry hook.
#[derive(Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
    on_expired: Option<ExpiredHook>,
}

impl SessionEvents {
    pub fn new(on_expired: Option<ExpiredHook>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx, on_expired }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Session event dropped, no subscribers");
        }
    }

    /// Report a forced logout to subscribers and the host hook.
    pub fn expired(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(hook) = &self.on_expired {
            hook(&reason);
        }
        self.emit(SessionEvent::Expired { reason });
    }

    pub(crate) fn refresh_failed(&self, failure: &RefreshFailure) {
        self.expired(failure.to_string());
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new(None)
    }
}
