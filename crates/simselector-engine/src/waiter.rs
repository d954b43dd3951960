//! Connection-state waits
//!
//! Single-device blocking poll. Only one SIM's rule is enabled while a wait
//! is in progress, so devices are never polled concurrently.

use crate::apn::ApnCatalog;
use crate::config::SelectorConfig;
use crate::notify::Notifier;
use crate::router::{get_string, paths, RouterConfigClient};
use crate::sim::SimRecord;
use crate::{Result, SelectorError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Blocks until a WAN device reaches a connection state
pub struct ConnectionWaiter {
    router: Arc<dyn RouterConfigClient>,
    poll: Duration,
    max_backoff: Duration,
    corrective: Option<(ApnCatalog, Arc<Notifier>)>,
}

impl ConnectionWaiter {
    /// Waiter with the configured budget and back-off
    pub fn new(router: Arc<dyn RouterConfigClient>, config: &SelectorConfig) -> Self {
        Self {
            router,
            poll: config.connection_poll(),
            max_backoff: config.connection_max_backoff(),
            corrective: None,
        }
    }

    /// Try alternate APNs for the device's carrier when a wait times out
    pub fn with_alternate_apns(mut self, catalog: ApnCatalog, notifier: Arc<Notifier>) -> Self {
        self.corrective = Some((catalog, notifier));
        self
    }

    /// Poll `sim`'s connection state until it equals `target`.
    ///
    /// The step grows by the base poll interval each round and is capped at
    /// the back-off ceiling; the budget counts time actually slept.
    pub async fn wait_for(&self, sim: &SimRecord, target: &str, timeout: Duration) -> Result<bool> {
        let path = paths::device_connection_state(&sim.uid);
        let mut waited = Duration::ZERO;
        let mut step = Duration::ZERO;
        info!("Connecting {}", sim.label());

        loop {
            let state = get_string(self.router.as_ref(), &path).await?;
            if state.as_deref() == Some(target) {
                info!("{} {}", sim.label(), target);
                return Ok(true);
            }
            info!(
                "Waiting for {} to connect. Current State={}. timeout in {}s",
                sim.label(),
                state.as_deref().unwrap_or("unknown"),
                timeout.saturating_sub(waited).as_secs()
            );

            if waited > timeout {
                warn!("Timeout waiting on {}. Testing Alternate APNs", sim.label());
                self.corrective_action(sim).await;
                return Err(SelectorError::Timeout(path));
            }

            step = (step + self.poll).min(self.max_backoff);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    async fn corrective_action(&self, sim: &SimRecord) {
        let Some((catalog, notifier)) = &self.corrective else {
            return;
        };
        let carrier = match get_string(
            self.router.as_ref(),
            &format!("{}/HOMECARRID", paths::device_diagnostics(&sim.uid)),
        )
        .await
        {
            Ok(carrier) => carrier.or_else(|| sim.diagnostics.as_ref().and_then(|d| d.home_carrier_id.clone())),
            Err(e) => {
                warn!("Failed to read carrier for {}: {}", sim.uid, e);
                None
            }
        };
        if let Err(e) = catalog
            .apply_alternates(self.router.as_ref(), notifier, carrier.as_deref(), sim.rule_id.as_deref())
            .await
        {
            warn!("Alternate APN update failed for {}: {}", sim.label(), e);
        }
    }
}
