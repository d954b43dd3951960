//! Per-run context
//!
//! Built once per phase run and dropped afterwards. SIM records never
//! outlive the run that measured them.

use crate::clock::Clock;
use crate::router::RouterConfigClient;
use crate::sim::SimRecord;
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// SIM records and handles for one phase run
pub struct SelectorSession {
    /// Correlates the log lines of one run
    pub run_id: Uuid,
    /// Discovered SIMs keyed by device uid
    pub sims: BTreeMap<String, SimRecord>,
    router: Arc<dyn RouterConfigClient>,
    clock: Arc<dyn Clock>,
}

impl SelectorSession {
    /// Empty session for `run_id`
    pub fn new(router: Arc<dyn RouterConfigClient>, clock: Arc<dyn Clock>, run_id: Uuid) -> Self {
        Self {
            run_id,
            sims: BTreeMap::new(),
            router,
            clock,
        }
    }

    /// Router this run talks to
    pub fn router(&self) -> &dyn RouterConfigClient {
        self.router.as_ref()
    }

    /// Local time for report stamps
    pub fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    /// Replace the SIM set with a fresh discovery, keeping results already
    /// measured in this run for devices that are still present
    pub fn refresh_sims(&mut self, fresh: BTreeMap<String, SimRecord>) {
        let mut previous = std::mem::take(&mut self.sims);
        self.sims = fresh
            .into_iter()
            .map(|(uid, mut sim)| {
                if let Some(old) = previous.remove(&uid) {
                    sim.diagnostics = old.diagnostics;
                    sim.signal_quality = old.signal_quality;
                    sim.download_mbps = old.download_mbps;
                    sim.upload_mbps = old.upload_mbps;
                    sim.below_minimum = old.below_minimum;
                    sim.connected = old.connected;
                    sim.failure = old.failure;
                }
                (uid, sim)
            })
            .collect();
    }

    /// Candidate rule id → port of the SIM bound to it
    pub fn port_of_rule(&self) -> HashMap<String, String> {
        self.sims
            .values()
            .filter_map(|s| s.rule_id.clone().map(|id| (id, s.port.clone())))
            .collect()
    }

    /// Rule ids in the given uid order, skipping SIMs without a rule
    pub fn rule_ids_in(&self, order: &[String]) -> Vec<String> {
        order
            .iter()
            .filter_map(|uid| self.sims.get(uid))
            .filter_map(|s| s.rule_id.clone())
            .collect()
    }
}
