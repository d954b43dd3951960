//! SimSelector Engine
//!
//! Chooses which SIM on a multi-SIM cellular router should carry traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          PHASE STATE MACHINE                            │
//! │        validation ──────────▶ performance ──────────▶ complete          │
//! │             │                      │                                    │
//! │  ┌──────────▼──────────┐  ┌────────▼─────────┐  ┌───────────────────┐   │
//! │  │   SIM DISCOVERY     │  │   MEASUREMENT    │  │      RANKER       │   │
//! │  │  + RULE DEDUP       │  │   ORCHESTRATOR   │  │  tie-break bands  │   │
//! │  └──────────┬──────────┘  └────────┬─────────┘  └─────────┬─────────┘   │
//! │             │                      │                      │             │
//! │  ┌──────────▼──────────────────────▼──────────────────────▼─────────┐   │
//! │  │              ROUTER CONFIG TREE  (status/ config/ control/)      │   │
//! │  │     WAN rules2 | WAN devices | dual-SIM masks | ECM channel      │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one worker drives a run. Only one SIM's WAN rule is enabled at a
//! time while SIMs are being measured, so throughput is attributable to a
//! single radio.

#![warn(missing_docs)]

pub mod apn;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod measure;
pub mod notify;
pub mod phase;
pub mod ranker;
pub mod report;
pub mod router;
pub mod rules;
pub mod session;
pub mod sim;
pub mod speed;
pub mod store;
pub mod waiter;

use thiserror::Error;

pub use clock::{Clock, SystemClock};
pub use cloud::CloudSync;
pub use config::{MinimumSpeeds, SelectorConfig, SpeedFloor};
pub use dedup::{PassOutcome, WanRuleDeduplicator};
pub use discovery::SimDiscovery;
pub use measure::{MeasureMode, MeasureOutcome, MeasurementOrchestrator};
pub use notify::{Channels, NotificationSink, Notifier};
pub use phase::{Collaborators, Phase, PhaseRecord, PhaseStateMachine, RunCommand, RunOutcome};
pub use ranker::{Ranker, Ranking};
pub use router::{InMemoryRouter, RouterConfigClient};
pub use session::SelectorSession;
pub use sim::{Diagnostics, SignalQuality, SimRecord, Technology};
pub use speed::{Reachability, SpeedProbe, SpeedTestRunner, TcpReachability};
pub use store::{InMemoryStateStore, JsonFileStateStore, StateStore};
pub use waiter::ConnectionWaiter;

/// Selector error types
#[derive(Debug, Error)]
pub enum SelectorError {
    /// A bounded wait exceeded its budget
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Fewer usable SIMs than required after discovery retries
    #[error("insufficient SIMs: found {found}, need at least {required}")]
    InsufficientSims {
        /// SIMs that qualified on the last attempt
        found: usize,
        /// Minimum required
        required: usize,
    },

    /// Speed probe or connection failure for one SIM
    #[error("measurement failed: {0}")]
    MeasurementFailure(String),

    /// Rule deduplication kept creating rules
    #[error("WAN rule deduplication did not settle after {passes} passes")]
    DedupDiverged {
        /// Passes attempted
        passes: u32,
    },

    /// Router config tree rejected or failed a request
    #[error("router config error: {0}")]
    Router(String),

    /// Raw device status could not be mapped onto a SIM record
    #[error("invalid device record: {0}")]
    InvalidRecord(String),

    /// State store failure
    #[error("state store error: {0}")]
    Store(String),

    /// Illegal phase transition
    #[error("phase error: {0}")]
    Phase(String),

    /// JSON error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error tag callers switch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`SelectorError::Timeout`]
    Timeout,
    /// See [`SelectorError::InsufficientSims`]
    InsufficientSims,
    /// See [`SelectorError::MeasurementFailure`]
    MeasurementFailure,
    /// Router, dedup and record errors
    Router,
    /// Store, phase and serialization errors
    State,
}

impl ErrorKind {
    /// Whether the workflow may continue with the next unit of work
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::MeasurementFailure)
    }
}

impl SelectorError {
    /// Tag for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SelectorError::Timeout(_) => ErrorKind::Timeout,
            SelectorError::InsufficientSims { .. } => ErrorKind::InsufficientSims,
            SelectorError::MeasurementFailure(_) => ErrorKind::MeasurementFailure,
            SelectorError::DedupDiverged { .. }
            | SelectorError::Router(_)
            | SelectorError::InvalidRecord(_) => ErrorKind::Router,
            SelectorError::Store(_)
            | SelectorError::Phase(_)
            | SelectorError::Serde(_)
            | SelectorError::Io(_) => ErrorKind::State,
        }
    }
}

/// Result type for the selector
pub type Result<T> = std::result::Result<T, SelectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(SelectorError::Timeout("mdm-1".into()).kind().is_recoverable());
        assert!(SelectorError::MeasurementFailure("probe".into()).kind().is_recoverable());

        let err = SelectorError::InsufficientSims { found: 1, required: 2 };
        assert_eq!(err.kind(), ErrorKind::InsufficientSims);
        assert!(!err.kind().is_recoverable());
        assert_eq!(err.to_string(), "insufficient SIMs: found 1, need at least 2");
    }
}
