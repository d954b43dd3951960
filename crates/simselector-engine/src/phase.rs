//! Phase State Machine
//!
//! `validation → performance → complete`, persisted in the [`StateStore`]
//! under `phase`. Only the phase crosses a reboot: an interrupted phase is
//! re-run from scratch against router truth, never resumed half-way.
//!
//! Any phase-level failure re-enables every WAN rule, reports the error and
//! leaves `phase` where it was. A cloud start is issued after every run.

use crate::apn::ApnCatalog;
use crate::clock::Clock;
use crate::cloud::CloudSync;
use crate::config::SelectorConfig;
use crate::dedup::WanRuleDeduplicator;
use crate::discovery::SimDiscovery;
use crate::measure::{MeasureMode, MeasurementOrchestrator};
use crate::notify::{Channels, NotificationSink, Notifier};
use crate::ranker::{Ranker, Ranking};
use crate::report::{final_report, validation_digest};
use crate::router::{get_f64, get_string, paths, RouterConfigClient};
use crate::rules::WanRuleTable;
use crate::session::SelectorSession;
use crate::speed::{Reachability, SpeedProbe, SpeedTestRunner};
use crate::store::StateStore;
use crate::waiter::ConnectionWaiter;
use crate::{Result, SelectorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

const PHASE_KEY: &str = "phase";
const HISTORY_KEY: &str = "phase_history";
const HISTORY_LIMIT: usize = 20;

/// Workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Boot-time staging: dedup, per-SIM connection and signal check
    #[default]
    Validation,
    /// Speed tests, ranking and priority rewrite
    Performance,
    /// Terminal until reset or forced
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Validation => "validation",
            Phase::Performance => "performance",
            Phase::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Phase {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validation" => Ok(Phase::Validation),
            "performance" => Ok(Phase::Performance),
            "complete" => Ok(Phase::Complete),
            other => Err(SelectorError::Phase(format!("unknown phase '{}'", other))),
        }
    }
}

/// One entry of the persisted phase history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Phase entered
    pub phase: Phase,
    /// When it was persisted
    pub at: DateTime<Utc>,
    /// What caused the transition
    pub reason: String,
}

/// How a run was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    /// Continue from the persisted phase
    Start,
    /// Restart from validation, ignoring the boot-time window
    Force,
    /// Restart from validation
    Reset,
}

/// What a run did
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing to do
    Skipped {
        /// Phase at the time of the request
        phase: Phase,
        /// Why nothing ran
        reason: String,
    },
    /// Priorities rewritten and `phase=complete` persisted
    Completed {
        /// Final SIM order
        ranking: Ranking,
        /// Text written to the description field
        report: String,
    },
}

/// Host-provided collaborators
pub struct Collaborators {
    /// Config tree client
    pub router: Arc<dyn RouterConfigClient>,
    /// Persists phase and buffered alerts
    pub store: Arc<dyn StateStore>,
    /// Log, alert and description outputs
    pub sink: Arc<dyn NotificationSink>,
    /// Throughput test backend
    pub probe: Arc<dyn SpeedProbe>,
    /// Gate for speed-test readiness
    pub reachability: Arc<dyn Reachability>,
    /// Timestamps for reports
    pub clock: Arc<dyn Clock>,
}

/// Drives the selection workflow
pub struct PhaseStateMachine {
    config: SelectorConfig,
    router: Arc<dyn RouterConfigClient>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<Notifier>,
    cloud: CloudSync,
    dedup: WanRuleDeduplicator,
    rules: WanRuleTable,
    measure: MeasurementOrchestrator,
    ranker: Ranker,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PhaseStateMachine {
    /// Wire every component against the host collaborators
    pub fn new(config: SelectorConfig, deps: Collaborators) -> Self {
        let Collaborators {
            router,
            store,
            sink,
            probe,
            reachability,
            clock,
        } = deps;

        let notifier = Arc::new(
            Notifier::new(sink, router.clone(), clock.clone(), config.app_name.clone())
                .with_store(store.clone())
                .with_limits(config.description_limit, config.notification_buffer_limit),
        );
        let cloud = CloudSync::new(router.clone(), notifier.clone(), &config);
        let discovery = Arc::new(SimDiscovery::new(router.clone(), notifier.clone(), &config));
        let dedup = WanRuleDeduplicator::new(router.clone(), discovery, &config);
        let rules = WanRuleTable::new(router.clone(), config.rule_settle(), config.priority_step);
        let waiter = ConnectionWaiter::new(router.clone(), &config)
            .with_alternate_apns(ApnCatalog::new(config.custom_apns.clone()), notifier.clone());
        let speed = Arc::new(SpeedTestRunner::new(probe, reachability, &config));
        let measure = MeasurementOrchestrator::new(router.clone(), waiter, speed, notifier.clone(), &config);
        let ranker = Ranker::new(config.tie_band);

        Self {
            config,
            router,
            store,
            clock,
            notifier,
            cloud,
            dedup,
            rules,
            measure,
            ranker,
            running: AtomicBool::new(false),
        }
    }

    /// Shared notifier, also used by the trigger watcher
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Active settings
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Persisted phase; `validation` when absent or unreadable
    pub async fn current_phase(&self) -> Result<Phase> {
        match self.store.get(PHASE_KEY).await? {
            None => Ok(Phase::Validation),
            Some(value) => match value.as_str().map(Phase::from_str) {
                Some(Ok(phase)) => Ok(phase),
                _ => {
                    warn!("Unreadable stored phase {}, starting from validation", value);
                    Ok(Phase::Validation)
                }
            },
        }
    }

    /// Transitions, oldest first
    pub async fn history(&self) -> Result<Vec<PhaseRecord>> {
        match self.store.get(HISTORY_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Force `phase=validation`
    pub async fn reset(&self) -> Result<()> {
        self.set_phase(Phase::Validation, "reset").await
    }

    async fn set_phase(&self, phase: Phase, reason: &str) -> Result<()> {
        self.store.set(PHASE_KEY, serde_json::to_value(phase)?).await?;

        let mut history = self.history().await.unwrap_or_default();
        history.push(PhaseRecord {
            phase,
            at: Utc::now(),
            reason: reason.to_string(),
        });
        if history.len() > HISTORY_LIMIT {
            history.drain(..history.len() - HISTORY_LIMIT);
        }
        self.store.set(HISTORY_KEY, serde_json::to_value(history)?).await?;
        info!(%phase, reason, "Phase persisted");
        Ok(())
    }

    /// Run the machine once. Concurrent calls are skipped.
    pub async fn run(&self, command: RunCommand) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(RunOutcome::Skipped {
                phase: self.current_phase().await?,
                reason: "a run is already in progress".into(),
            });
        }
        let _guard = RunningGuard(&self.running);

        let run_id = Uuid::new_v4();
        let span = info_span!("phase_run", %run_id, ?command);
        let result = self.run_inner(command, run_id).instrument(span).await;

        if let Err(e) = self.cloud.start().await {
            warn!("Failed to restart NCM: {}", e);
        }
        result
    }

    async fn run_inner(&self, command: RunCommand, run_id: Uuid) -> Result<RunOutcome> {
        match command {
            RunCommand::Reset => self.set_phase(Phase::Validation, "reset").await?,
            RunCommand::Force => self.set_phase(Phase::Validation, "force").await?,
            RunCommand::Start => {}
        }

        let phase = self.current_phase().await?;
        info!(%phase, "Run requested");
        match phase {
            Phase::Complete => {
                return Ok(RunOutcome::Skipped {
                    phase,
                    reason: "selection already complete".into(),
                })
            }
            Phase::Validation if command != RunCommand::Force => {
                let uptime = get_f64(self.router.as_ref(), paths::SYSTEM_UPTIME)
                    .await?
                    .unwrap_or(0.0);
                if uptime > self.config.validation_uptime_limit().as_secs_f64() {
                    self.notifier
                        .notify(
                            Channels::SYNC,
                            "Uptime is over 5 minutes, Restart router to run script, Clear this description field to cancel.",
                        )
                        .await;
                    return Ok(RunOutcome::Skipped {
                        phase,
                        reason: format!("uptime {}s is past the validation window", uptime),
                    });
                }
            }
            _ => {}
        }

        match self.execute(phase, run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.recover(&e).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, phase: Phase, run_id: Uuid) -> Result<RunOutcome> {
        self.cloud.wait_for_sync().await?;
        let system_id = self.announce().await?;

        if phase == Phase::Validation {
            self.validation(run_id).await?;
        }
        self.performance(run_id, &system_id).await
    }

    /// "<app> Starting! <system_id> - <product> - Router ID: <id>"
    async fn announce(&self) -> Result<String> {
        let router = self.router.as_ref();
        let product = get_string(router, paths::PRODUCT_NAME).await?.unwrap_or_default();
        let system_id = get_string(router, paths::SYSTEM_ID).await?.unwrap_or_default();
        let router_id = get_string(router, paths::ECM_CLIENT_ID).await?.unwrap_or_default();

        let message = format!(
            "{} Starting! {} - {} - Router ID: {}",
            self.config.app_name, system_id, product, router_id
        );
        info!("Sending alert to NCM: {}", message);
        self.notifier.send(Channels::NOTIFY, &message).await;
        Ok(system_id)
    }

    async fn validation(&self, run_id: Uuid) -> Result<()> {
        info!("Validation phase");
        let mut session = self.session(run_id);
        session.sims = self.dedup.deduplicate().await?;

        // let the startup alert leave before the channel stops
        tokio::time::sleep(self.config.alert_settle()).await;
        self.cloud.suspend().await?;
        self.rules.disable_all().await?;

        self.isolation_loop(&mut session, MeasureMode::Staging).await?;

        let digest = validation_digest(session.now(), &session.sims, self.config.description_limit);
        info!("{}", digest);
        self.notifier.notify(Channels::SYNC, &digest).await;

        self.set_phase(Phase::Performance, "validation complete").await
    }

    async fn performance(&self, run_id: Uuid, system_id: &str) -> Result<RunOutcome> {
        info!("Performance phase");
        let mut session = self.session(run_id);
        session.sims = self.dedup.deduplicate().await?;

        self.cloud.suspend().await?;
        self.rules.disable_all().await?;

        self.isolation_loop(&mut session, MeasureMode::Full).await?;

        let ranking = self.ranker.rank(session.sims.values());
        info!("Prioritizing SIMs: {:?}", ranking.order);
        self.rules
            .rewrite_priorities(&session.rule_ids_in(&ranking.order))
            .await?;
        let enabled = self.rules.commit_per_port(&session.port_of_rule()).await?;
        info!("Enabled WAN rules: {:?}", enabled);

        // The rule table is final from here on: nothing below may fail the
        // run, or recovery would re-enable every rule.
        if let Err(e) = self.set_phase(Phase::Complete, "priorities committed").await {
            error!("Failed to persist phase after commit: {}", e);
        }

        let report = final_report(
            session.now(),
            &session.sims,
            &ranking,
            &self.config.minimum_speeds,
            self.config.description_limit,
        );
        self.notifier.describe(&report).await;

        if let Err(e) = self.cloud.resume().await {
            warn!("NCM did not come back after commit: {}", e);
        }
        self.notifier
            .notify(
                Channels::NOTIFY,
                &format!("Complete! {} Results: {}", system_id, report),
            )
            .await;

        Ok(RunOutcome::Completed { ranking, report })
    }

    /// Enable one SIM's rule at a time, measure, disable again.
    ///
    /// If a SIM's rule is gone (or the device now follows another rule), all
    /// rules are re-enabled and deduplication runs once more; SIMs measured
    /// so far keep their results.
    async fn isolation_loop(&self, session: &mut SelectorSession, mode: MeasureMode) -> Result<()> {
        let mut done: HashSet<String> = HashSet::new();
        let mut rededup_done = false;

        'rescan: loop {
            let pending: Vec<String> = session
                .sims
                .keys()
                .filter(|uid| !done.contains(*uid))
                .cloned()
                .collect();

            for uid in pending {
                let Some(rule_id) = self.live_rule_id(session, &uid).await? else {
                    if rededup_done {
                        warn!("No usable WAN rule for {}, skipping", uid);
                        if let Some(sim) = session.sims.get_mut(&uid) {
                            sim.mark_failed("WAN rule missing");
                            sim.below_minimum = true;
                        }
                        done.insert(uid);
                        continue;
                    }
                    warn!("WAN rule for {} vanished, re-running deduplication", uid);
                    self.rules.enable_all().await?;
                    let fresh = self.dedup.deduplicate().await?;
                    session.refresh_sims(fresh);
                    self.rules.disable_all().await?;
                    rededup_done = true;
                    continue 'rescan;
                };

                let Some(sim) = session.sims.get_mut(&uid) else {
                    continue;
                };
                self.rules.set_disabled(&rule_id, false).await?;
                let outcome = self.measure.measure(sim, mode).await;
                self.rules.set_disabled(&rule_id, true).await?;
                info!(uid = %uid, ?outcome, "SIM measured");
                outcome?;
                done.insert(uid);
            }
            return Ok(());
        }
    }

    /// Rule the device follows right now, if it is still the one this run
    /// bound it to and it still exists
    async fn live_rule_id(&self, session: &SelectorSession, uid: &str) -> Result<Option<String>> {
        let expected = session.sims.get(uid).and_then(|s| s.rule_id.clone());
        let live = get_string(session.router(), &paths::device_rule_id(uid)).await?;
        match (expected, live) {
            (Some(expected), Some(live)) if expected == live => {
                if self.rules.exists(&live).await? {
                    Ok(Some(live))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn recover(&self, error: &SelectorError) {
        error!("Run failed: {}", error);
        if let Err(e) = self.rules.enable_all().await {
            error!("Failed to re-enable WAN rules: {}", e);
        }
        self.notifier
            .notify(
                Channels::SYNC,
                &format!("Failed with {:?}: {}", error.kind(), error),
            )
            .await;
    }

    fn session(&self, run_id: Uuid) -> SelectorSession {
        SelectorSession::new(self.router.clone(), self.clock.clone(), run_id)
    }
}
