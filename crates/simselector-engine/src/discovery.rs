//! SIM discovery

use crate::config::SelectorConfig;
use crate::notify::{Channels, Notifier};
use crate::router::{get_string, paths, RouterConfigClient};
use crate::sim::SimRecord;
use crate::{Result, SelectorError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Enumerates SIM-bearing WAN devices that report a SIM
pub struct SimDiscovery {
    router: Arc<dyn RouterConfigClient>,
    notifier: Arc<Notifier>,
    attempts: u32,
    interval: Duration,
    mask_settle: Duration,
    min_sims: usize,
}

impl SimDiscovery {
    /// Discovery with the configured retry policy
    pub fn new(router: Arc<dyn RouterConfigClient>, notifier: Arc<Notifier>, config: &SelectorConfig) -> Self {
        Self {
            router,
            notifier,
            attempts: config.discovery_attempts.max(1),
            interval: config.discovery_interval(),
            mask_settle: config.mask_settle(),
            min_sims: config.min_sims,
        }
    }

    /// Poll until at least the minimum number of SIMs is present.
    ///
    /// Every short attempt clears the dual-SIM disable masks before the
    /// next poll.
    pub async fn discover(&self) -> Result<BTreeMap<String, SimRecord>> {
        let mut attempt = 0;
        loop {
            let sims = self.scan().await?;
            if sims.len() >= self.min_sims {
                info!("Found SIMs: {:?}", sims.keys().collect::<Vec<_>>());
                return Ok(sims);
            }

            match sims.len() {
                0 => info!("No SIMs found at all yet"),
                n => info!("Only {} SIM(s) found!", n),
            }
            self.reset_masks().await?;

            attempt += 1;
            if attempt >= self.attempts {
                self.notifier
                    .notify(Channels::SYNC, &format!("Timeout: Did not find {} or more SIMs", self.min_sims))
                    .await;
                return Err(SelectorError::InsufficientSims {
                    found: sims.len(),
                    required: self.min_sims,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pass over `status/wan/devices`
    pub async fn scan(&self) -> Result<BTreeMap<String, SimRecord>> {
        let devices = match self.router.get(paths::WAN_DEVICES).await? {
            Some(Value::Object(devices)) => devices,
            _ => return Ok(BTreeMap::new()),
        };

        let mut sims = BTreeMap::new();
        for (uid, device) in devices.iter().filter(|(uid, _)| uid.starts_with(paths::MODEM_PREFIX)) {
            if SimRecord::device_has_no_sim(device) {
                continue;
            }
            match SimRecord::from_device(uid, device) {
                Ok(sim) => {
                    sims.insert(uid.clone(), sim);
                }
                Err(e) => warn!("Skipping {}: {}", uid, e),
            }
        }
        Ok(sims)
    }

    /// Clear both dual-SIM disable masks if set, then let the modems settle
    pub async fn reset_masks(&self) -> Result<()> {
        let masks = [
            (paths::DUAL_SIM_MASK, "Resetting Dual Sim Mask"),
            (paths::REMOTE_DUAL_SIM_MASK, "Resetting Remote Dual Sim Mask"),
        ];
        for (path, message) in masks {
            let current = get_string(self.router.as_ref(), path).await?;
            if current.map(|m| !m.is_empty()).unwrap_or(false) {
                self.notifier.notify(Channels::SYNC, message).await;
                self.router.put(path, json!("")).await?;
            }
        }
        tokio::time::sleep(self.mask_settle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::InMemorySink;
    use crate::router::InMemoryRouter;

    fn setup(router: Arc<InMemoryRouter>) -> (SimDiscovery, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        let notifier = Arc::new(Notifier::new(sink.clone(), router.clone(), Arc::new(SystemClock), "SimSelector"));
        (SimDiscovery::new(router, notifier, &SelectorConfig::default()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_excludes_nosim_and_non_modems() {
        let router = Arc::new(
            InMemoryRouter::new()
                .with_rule("r1", 1.0, "type|is|mdm")
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480")
                .with_modem("mdm-b", "int1", "sim2", "lte", Some(-90.0), "310410")
                .with_modem("mdm-c", "mc400", "sim1", "5G", None, "310410")
                .with_device("ethernet-wan", json!({"info": {"port": "wan"}, "status": {}})),
        );
        router.set_value("status/wan/devices/mdm-c/status/error_text", json!("NOSIM"));
        let (discovery, _) = setup(router);

        let sims = discovery.discover().await.unwrap();
        assert_eq!(sims.keys().collect::<Vec<_>>(), vec!["mdm-a", "mdm-b"]);
        assert_eq!(sims["mdm-a"].rule_id.as_deref(), Some("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_sims_after_retries() {
        let router = Arc::new(
            InMemoryRouter::new()
                .with_rule("r1", 1.0, "type|is|mdm")
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480"),
        );
        router.set_value(paths::DUAL_SIM_MASK, json!("sim2"));
        let (discovery, sink) = setup(router.clone());

        let start = tokio::time::Instant::now();
        let err = discovery.discover().await.unwrap_err();
        assert!(matches!(err, SelectorError::InsufficientSims { found: 1, required: 2 }));
        // 10 settle waits and 9 poll intervals
        assert_eq!(start.elapsed(), Duration::from_secs(140));
        assert_eq!(router.value(paths::DUAL_SIM_MASK), Some(json!("")));

        let alerts = sink.alerts();
        assert_eq!(alerts.first().map(String::as_str), Some("SimSelector: Resetting Dual Sim Mask"));
        assert_eq!(
            alerts.last().map(String::as_str),
            Some("SimSelector: Timeout: Did not find 2 or more SIMs")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_sim_appears_after_mask_reset() {
        let router = Arc::new(
            InMemoryRouter::new()
                .with_rule("r1", 1.0, "type|is|mdm")
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480"),
        );
        let late = router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            late.set_value(
                "status/wan/devices/mdm-b",
                json!({"info": {"port": "int1", "sim": "sim2", "tech": "lte"}, "status": {"error_text": ""}}),
            );
        });
        let (discovery, _) = setup(router);

        let sims = discovery.discover().await.unwrap();
        assert_eq!(sims.len(), 2);
    }
}
