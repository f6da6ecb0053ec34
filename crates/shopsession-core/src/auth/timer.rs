use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::coordinator::RefreshCoordinator;
use super::store::CredentialStore;
use crate::api::{ApiError, RefreshFailure};

/// Refresh the access credential every `period` so requests rarely see a 401.
///
/// The first tick fires one period after start. Ticks without a refresh
/// credential do nothing. A failed refresh ends the session the same way a
/// reactive one does, inside the coordinator.
pub fn spawn_refresh_timer(
    coordinator: RefreshCoordinator,
    store: CredentialStore,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = period.as_secs_f64(), "Passive refresh timer started");
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {}
            }

            if store.refresh().is_none() {
                trace!("No refresh credential, skipping passive refresh");
                continue;
            }

            debug!(joining = coordinator.is_refreshing(), "Passive refresh tick");
            match coordinator.refresh().await {
                Ok(_) => debug!("Passive refresh succeeded"),
                Err(ApiError::NoRefreshCredential)
                | Err(ApiError::RefreshFailed(RefreshFailure::SessionEnded)) => {
                    debug!("Session ended around passive refresh")
                }
                Err(e) => warn!(error = %e, "Passive refresh failed"),
            }
        }
        info!("Passive refresh timer stopped");
    })
}
