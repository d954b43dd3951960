//! SimSelector - On-router SIM selection daemon
//!
//! Runs on the cellular router next to the modems it tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SIMSELECTOR DAEMON                            │
//! │                                                                         │
//! │  ┌──────────────────────┐        ┌───────────────────────────────────┐  │
//! │  │  DESCRIPTION TRIGGER │──cmd──▶│        PHASE STATE MACHINE        │  │
//! │  │  start|force|reset   │        │   (simselector-engine, 1 worker)  │  │
//! │  └──────────┬───────────┘        └──────┬──────────────┬─────────────┘  │
//! │             │                           │              │                │
//! │  ┌──────────▼───────────────────────────▼──┐  ┌────────▼─────────────┐  │
//! │  │          ROUTER LOCAL API (HTTP)        │  │  HTTP SPEED PROBE    │  │
//! │  │  config/ status/ control/  alerts, desc │  │  latency|down|up     │  │
//! │  └─────────────────────────────────────────┘  └──────────────────────┘  │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │  STATE FILE   phase | phase_history | pending_notifications       │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod notify;
pub mod router_api;
pub mod speedtest;
pub mod trigger;

use parking_lot::RwLock;
use simselector_engine::apn::ApnCatalog;
use simselector_engine::router::{get_string, paths};
use simselector_engine::rules::WanRuleTable;
use simselector_engine::{
    Collaborators, JsonFileStateStore, Phase, PhaseRecord, PhaseStateMachine, RouterConfigClient,
    RunCommand, RunOutcome, SelectorError, SystemClock, TcpReachability,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use config::EdgeConfig;
pub use notify::RouterNotificationSink;
pub use router_api::HttpRouterClient;
pub use speedtest::HttpSpeedProbe;
pub use trigger::DescriptionTrigger;

const WAN_POLL: Duration = Duration::from_secs(1);

/// Daemon error types
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Unusable configuration
    #[error("config error: {0}")]
    Config(String),
    /// HTTP client could not be built
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Engine failure
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// Daemon result type
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Daemon lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Waiting for WAN and applying startup hygiene
    Initializing,
    /// Watching the description field
    Idle,
    /// A phase run is in progress
    Running,
}

/// Phase, history and current description, for `simselector status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Persisted phase
    pub phase: Phase,
    /// Transitions, oldest first
    pub history: Vec<PhaseRecord>,
    /// Router description field
    pub description: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase: {}", self.phase)?;
        if let Some(desc) = &self.description {
            writeln!(f, "description: {}", desc)?;
        }
        for record in &self.history {
            writeln!(
                f,
                "  {}  {:<12} {}",
                record.at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                record.phase.to_string(),
                record.reason
            )?;
        }
        Ok(())
    }
}

/// On-router daemon
pub struct SimSelectorDaemon {
    config: EdgeConfig,
    router: Arc<dyn RouterConfigClient>,
    machine: PhaseStateMachine,
    trigger: DescriptionTrigger,
    catalog: ApnCatalog,
    state: RwLock<DaemonState>,
}

impl SimSelectorDaemon {
    /// Daemon talking to the router over HTTP
    pub fn new(config: EdgeConfig) -> Result<Self> {
        if config.speedtest.servers.is_empty() {
            return Err(EdgeError::Config("no speed-test servers configured".into()));
        }
        let router: Arc<dyn RouterConfigClient> = Arc::new(HttpRouterClient::new(&config.router)?);
        let probe = Arc::new(HttpSpeedProbe::new(&config.speedtest)?);
        let reachability = Arc::new(TcpReachability::new(
            config.selector.reachability_host.clone(),
            config.selector.reachability_interval().max(Duration::from_secs(1)),
        ));

        let collaborators = Collaborators {
            router: router.clone(),
            store: Arc::new(JsonFileStateStore::new(config.state_path.clone())),
            sink: Arc::new(RouterNotificationSink::new(router)),
            probe,
            reachability,
            clock: Arc::new(SystemClock),
        };
        Ok(Self::with_collaborators(config, collaborators))
    }

    /// Daemon over caller-provided collaborators
    pub fn with_collaborators(config: EdgeConfig, collaborators: Collaborators) -> Self {
        let router = collaborators.router.clone();
        let machine = PhaseStateMachine::new(config.selector.clone(), collaborators);
        let trigger = DescriptionTrigger::new(router.clone(), machine.notifier().clone());
        let catalog = ApnCatalog::new(config.selector.custom_apns.clone());

        Self {
            config,
            router,
            machine,
            trigger,
            catalog,
            state: RwLock::new(DaemonState::Initializing),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }

    /// Startup: wait for WAN, restore buffered alerts, APN hygiene
    pub async fn init(&self) -> Result<()> {
        info!("Initializing SimSelector...");
        *self.state.write() = DaemonState::Initializing;

        self.wait_for_wan().await;

        if let Err(e) = self.machine.notifier().restore().await {
            warn!("Could not restore buffered notifications: {}", e);
        }
        if let Err(e) = self.apn_hygiene().await {
            warn!("APN check failed: {}", e);
        }

        *self.state.write() = DaemonState::Idle;
        info!("SimSelector initialized");
        Ok(())
    }

    /// Boot run, then watch the description field forever
    pub async fn run(&self) -> Result<()> {
        let first = match self.trigger.poll().await {
            Ok(command) => command.unwrap_or(RunCommand::Start),
            Err(e) => {
                warn!("Could not read description field: {}", e);
                RunCommand::Start
            }
        };
        if let Err(e) = self.run_once(first).await {
            error!("Boot run failed: {}", e);
        }

        let mut interval = tokio::time::interval(self.config.trigger_poll());
        loop {
            interval.tick().await;
            if let Err(e) = self.handle_trigger().await {
                error!("Triggered run failed: {}", e);
            }
        }
    }

    /// Poll the description field once and run whatever it asks for
    pub async fn handle_trigger(&self) -> Result<Option<RunOutcome>> {
        match self.trigger.poll().await? {
            Some(command) => self.run_once(command).await.map(Some),
            None => Ok(None),
        }
    }

    /// One pass of the phase machine
    pub async fn run_once(&self, command: RunCommand) -> Result<RunOutcome> {
        *self.state.write() = DaemonState::Running;
        let result = self.machine.run(command).await;
        *self.state.write() = DaemonState::Idle;

        match &result {
            Ok(RunOutcome::Skipped { phase, reason }) => info!(%phase, "Run skipped: {}", reason),
            Ok(RunOutcome::Completed { report, .. }) => info!("Run complete: {}", report),
            Err(e) => warn!("Run failed: {}", e),
        }
        Ok(result?)
    }

    /// Force `phase=validation` without running
    pub async fn reset(&self) -> Result<()> {
        self.machine.reset().await?;
        Ok(())
    }

    /// Persisted phase and history
    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            phase: self.machine.current_phase().await?,
            history: self.machine.history().await?,
            description: get_string(self.router.as_ref(), paths::DESCRIPTION).await?,
        })
    }

    /// Block until the router WAN is up. A previous run that died with every
    /// rule disabled leaves the router offline, so each timeout re-enables
    /// all rules before waiting again.
    async fn wait_for_wan(&self) {
        let rules = WanRuleTable::new(
            self.router.clone(),
            self.config.selector.rule_settle(),
            self.config.selector.priority_step,
        );
        let budget = self.config.boot_wan_timeout();

        loop {
            let mut waited = Duration::ZERO;
            while waited < budget {
                match get_string(self.router.as_ref(), paths::WAN_CONNECTION_STATE).await {
                    Ok(Some(state)) if state == "connected" => return,
                    Ok(_) => {}
                    Err(e) => debug!("WAN state unavailable: {}", e),
                }
                tokio::time::sleep(WAN_POLL).await;
                waited += WAN_POLL;
            }
            warn!("WAN not connected after {:?}, enabling all WAN rules", budget);
            if let Err(e) = rules.enable_all().await {
                warn!("Failed to enable WAN rules: {}", e);
            }
        }
    }

    async fn apn_hygiene(&self) -> Result<()> {
        if self.catalog.ensure_custom_apns(self.router.as_ref()).await? {
            info!("Custom APN list updated");
        }
        let cleared = self
            .catalog
            .clear_manual_apns(self.router.as_ref(), self.machine.notifier())
            .await?;
        if !cleared.is_empty() {
            info!("Cleared manual APNs on rules {:?}", cleared);
        }
        Ok(())
    }
}
