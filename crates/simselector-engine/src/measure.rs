//! Per-SIM measurement
//!
//! The caller isolates the SIM (its rule enabled, all others disabled)
//! before calling [`MeasurementOrchestrator::measure`] and restores the table
//! afterwards. Failures are recorded on the record and never abort the batch.

use crate::config::{MinimumSpeeds, SelectorConfig};
use crate::notify::{Channels, Notifier};
use crate::router::{paths, RouterConfigClient};
use crate::sim::{Diagnostics, SignalQuality, SimRecord};
use crate::speed::SpeedTestRunner;
use crate::waiter::ConnectionWaiter;
use crate::{ErrorKind, Result, SelectorError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How much of the measurement to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureMode {
    /// Connection and diagnostics only
    Staging,
    /// Diagnostics and speed test
    Full,
}

/// Result of measuring one SIM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureOutcome {
    /// Diagnostics captured (staging mode)
    Staged,
    /// Diagnostics and speeds captured
    Measured,
    /// Never connected; speeds forced to zero
    TimedOut,
    /// Connected but the speed test produced nothing; speeds forced to zero
    SpeedTestFailed,
}

/// Isolated connection, diagnostics and speed test for one SIM
pub struct MeasurementOrchestrator {
    router: Arc<dyn RouterConfigClient>,
    waiter: ConnectionWaiter,
    speed: Arc<SpeedTestRunner>,
    notifier: Arc<Notifier>,
    minimums: MinimumSpeeds,
    timeout: Duration,
}

impl MeasurementOrchestrator {
    /// Orchestrator over a waiter and a speed-test runner
    pub fn new(
        router: Arc<dyn RouterConfigClient>,
        waiter: ConnectionWaiter,
        speed: Arc<SpeedTestRunner>,
        notifier: Arc<Notifier>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            router,
            waiter,
            speed,
            notifier,
            minimums: config.minimum_speeds,
            timeout: config.connection_timeout(),
        }
    }

    /// Measure `sim`, recording everything on the record
    pub async fn measure(&self, sim: &mut SimRecord, mode: MeasureMode) -> Result<MeasureOutcome> {
        match self.waiter.wait_for(sim, "connected", self.timeout).await {
            Ok(_) => sim.connected = true,
            Err(SelectorError::Timeout(_)) => {
                let message = format!("Timed out running speedtest on {}", sim.label());
                self.notifier.notify(Channels::NOTIFY, &message).await;
                sim.mark_failed(message);
                sim.below_minimum = true;
                return Ok(MeasureOutcome::TimedOut);
            }
            Err(e) => return Err(e),
        }

        let diagnostics = self
            .router
            .get(&paths::device_diagnostics(&sim.uid))
            .await?
            .map(|raw| Diagnostics::from_value(&raw))
            .unwrap_or_default();
        sim.signal_quality = SignalQuality::from_rsrp(diagnostics.rsrp);
        info!(
            "Modem Diagnostics: {} RSRP:{} ({})",
            sim.label(),
            diagnostics.rsrp.map(|r| r.to_string()).unwrap_or_else(|| "None".into()),
            sim.signal_quality
        );
        sim.diagnostics = Some(diagnostics);

        if mode == MeasureMode::Staging {
            return Ok(MeasureOutcome::Staged);
        }

        match self.speed.run(&sim.label()).await {
            Ok((down, up)) => {
                sim.download_mbps = Some(down);
                sim.upload_mbps = Some(up);
                sim.failure = None;
                info!(
                    "Speedtest Results: {} TCP Download: {:.2}Mbps TCP Upload: {:.2}Mbps",
                    sim.label(),
                    down,
                    up
                );
                sim.below_minimum = self.minimums.is_below(sim.technology, down, up);
                if sim.below_minimum {
                    info!("{} Failed to meet minimums! {}", sim.label(), self.minimums);
                }
                Ok(MeasureOutcome::Measured)
            }
            Err(e) if e.kind() == ErrorKind::MeasurementFailure => {
                warn!("Speed test failed on {}: {}", sim.label(), e);
                sim.download_mbps = Some(0.0);
                sim.upload_mbps = Some(0.0);
                sim.below_minimum = true;
                sim.failure = Some(e.to_string());
                Ok(MeasureOutcome::SpeedTestFailed)
            }
            Err(e) => Err(e),
        }
    }
}
