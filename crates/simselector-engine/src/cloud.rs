//! Management-cloud (ECM) channel control
//!
//! The channel is stopped while SIMs are isolated so cloud-pushed config
//! cannot race the rule table, and restarted once the run is over.

use crate::config::SelectorConfig;
use crate::notify::Notifier;
use crate::router::{get_string, paths, RouterConfigClient};
use crate::{Result, SelectorError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Suspend/resume of the management-cloud sync channel
pub struct CloudSync {
    router: Arc<dyn RouterConfigClient>,
    notifier: Arc<Notifier>,
    timeout: Duration,
    poll: Duration,
}

impl CloudSync {
    /// Channel control with the configured wait budget
    pub fn new(router: Arc<dyn RouterConfigClient>, notifier: Arc<Notifier>, config: &SelectorConfig) -> Self {
        Self {
            router,
            notifier,
            timeout: config.cloud_timeout(),
            poll: config.cloud_poll(),
        }
    }

    /// Block until WAN is connected, then the channel is connected and synced
    pub async fn wait_for_sync(&self) -> Result<()> {
        self.wait_until(paths::WAN_CONNECTION_STATE, "connected", "WAN connecting", false)
            .await?;

        if !self.is(paths::ECM_STATE, "connected").await? {
            info!("Waiting until NCM is connected...");
            self.start().await?;
        }
        self.wait_until(paths::ECM_STATE, "connected", "NCM connecting", false)
            .await?;

        if !self.is(paths::ECM_SYNC, "ready").await? {
            info!("Waiting until NCM is synced...");
        }
        self.wait_until(paths::ECM_SYNC, "ready", "NCM syncing", true).await
    }

    /// Stop the channel once pending sync is done; no-op if already stopped
    pub async fn suspend(&self) -> Result<()> {
        if self.is(paths::ECM_STATE, "stopped").await? {
            info!("NCM already stopped");
            return Ok(());
        }
        info!("Stopping NCM");
        self.wait_until(paths::ECM_SYNC, "ready", "NCM sync ready", false)
            .await?;
        self.router.put(paths::ECM_CONTROL, json!({"stop": true})).await?;
        self.wait_until(paths::ECM_STATE, "stopped", "NCM stopping", false)
            .await
    }

    /// Restart the channel, wait for resync and flush buffered notifications
    pub async fn resume(&self) -> Result<()> {
        info!("Starting NCM");
        self.start().await?;
        self.wait_for_sync().await?;
        self.notifier.flush().await;
        Ok(())
    }

    /// Fire a start command without waiting
    pub async fn start(&self) -> Result<()> {
        self.router.put(paths::ECM_CONTROL, json!({"start": true})).await?;
        Ok(())
    }

    async fn is(&self, path: &str, expected: &str) -> Result<bool> {
        Ok(get_string(self.router.as_ref(), path).await?.as_deref() == Some(expected))
    }

    async fn wait_until(&self, path: &str, expected: &str, what: &str, nudge: bool) -> Result<()> {
        let mut waited = Duration::ZERO;
        loop {
            if self.is(path, expected).await? {
                return Ok(());
            }
            if waited >= self.timeout {
                return Err(SelectorError::Timeout(what.to_string()));
            }
            if nudge {
                self.start().await?;
            }
            tokio::time::sleep(self.poll).await;
            waited += self.poll;
        }
    }
}
