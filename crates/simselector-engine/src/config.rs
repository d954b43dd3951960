//! Selector Configuration

use crate::sim::Technology;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Name prefixed to every notification
    pub app_name: String,
    /// Minimum SIMs needed for a selection run
    pub min_sims: usize,
    /// Discovery poll attempts
    pub discovery_attempts: u32,
    /// Seconds between discovery attempts
    pub discovery_interval_secs: u64,
    /// Seconds to wait after clearing a dual-SIM mask
    pub mask_settle_secs: u64,
    /// Ceiling for a single connection-state wait
    pub connection_timeout_secs: u64,
    /// Base poll step for connection-state waits
    pub connection_poll_secs: u64,
    /// Back-off cap for connection-state waits
    pub connection_max_backoff_secs: u64,
    /// host:port used to confirm internet reachability
    pub reachability_host: String,
    /// Seconds between reachability attempts
    pub reachability_interval_secs: u64,
    /// Reachability budget
    pub reachability_timeout_secs: u64,
    /// Speed test attempts when the probe returns nothing
    pub speedtest_attempts: u32,
    /// Relative difference treated as a tie (0.10 = 10%)
    pub tie_band: f64,
    /// Per-technology speed floors
    pub minimum_speeds: MinimumSpeeds,
    /// Validation only runs within this many seconds of boot
    pub validation_uptime_limit_secs: u64,
    /// Priority increment per rank and per cloned duplicate
    pub priority_step: f64,
    /// Discovery+dedup passes before giving up
    pub max_dedup_passes: u32,
    /// Clones allowed per shared rule in one pass
    pub max_duplicate_clones: u32,
    /// Seconds to let the router apply bulk rule changes
    pub rule_settle_secs: u64,
    /// Seconds to let the startup alert leave before the cloud channel stops
    pub alert_settle_secs: u64,
    /// Ceiling for each cloud channel wait
    pub cloud_timeout_secs: u64,
    /// Poll step for cloud channel waits
    pub cloud_poll_secs: u64,
    /// Description field size limit in bytes
    pub description_limit: usize,
    /// Notifications kept while the cloud channel is down
    pub notification_buffer_limit: usize,
    /// Carrier to APN table used for alternate-APN retries
    pub custom_apns: Vec<CustomApn>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            app_name: "SimSelector".into(),
            min_sims: 2,
            discovery_attempts: 10,
            discovery_interval_secs: 10,
            mask_settle_secs: 5,
            connection_timeout_secs: 7 * 60,
            connection_poll_secs: 5,
            connection_max_backoff_secs: 45,
            reachability_host: "www.speedtest.net:80".into(),
            reachability_interval_secs: 2,
            reachability_timeout_secs: 60,
            speedtest_attempts: 2,
            tie_band: 0.10,
            minimum_speeds: MinimumSpeeds::default(),
            validation_uptime_limit_secs: 5 * 60,
            priority_step: 0.1,
            max_dedup_passes: 10,
            max_duplicate_clones: 20,
            rule_settle_secs: 5,
            alert_settle_secs: 10,
            cloud_timeout_secs: 7 * 60,
            cloud_poll_secs: 2,
            description_limit: 1023,
            notification_buffer_limit: 25,
            custom_apns: CustomApn::defaults(),
        }
    }
}

impl SelectorConfig {
    /// Wait between discovery attempts
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    /// Settle time after clearing the dual-SIM masks
    pub fn mask_settle(&self) -> Duration {
        Duration::from_secs(self.mask_settle_secs)
    }

    /// Per-SIM connection budget
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// First connection poll step
    pub fn connection_poll(&self) -> Duration {
        Duration::from_secs(self.connection_poll_secs)
    }

    /// Largest connection poll step
    pub fn connection_max_backoff(&self) -> Duration {
        Duration::from_secs(self.connection_max_backoff_secs)
    }

    /// Readiness probe interval
    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_interval_secs)
    }

    /// Readiness gate budget
    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    /// Uptime past which validation will not start
    pub fn validation_uptime_limit(&self) -> Duration {
        Duration::from_secs(self.validation_uptime_limit_secs)
    }

    /// Settle time after a rule-table write
    pub fn rule_settle(&self) -> Duration {
        Duration::from_secs(self.rule_settle_secs)
    }

    /// Time given to the startup alert before the channel stops
    pub fn alert_settle(&self) -> Duration {
        Duration::from_secs(self.alert_settle_secs)
    }

    /// Budget for each management-cloud wait
    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_secs)
    }

    /// Management-cloud poll interval
    pub fn cloud_poll(&self) -> Duration {
        Duration::from_secs(self.cloud_poll_secs)
    }
}

/// Download/upload floor in Mbps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedFloor {
    /// Download floor
    pub download_mbps: f64,
    /// Upload floor
    pub upload_mbps: f64,
}

/// Minimum speeds keyed by technology class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinimumSpeeds {
    /// 5G floor
    pub five_g: SpeedFloor,
    /// LTE and anything else
    pub lte: SpeedFloor,
}

impl Default for MinimumSpeeds {
    fn default() -> Self {
        Self {
            five_g: SpeedFloor { download_mbps: 30.0, upload_mbps: 2.0 },
            lte: SpeedFloor { download_mbps: 10.0, upload_mbps: 1.0 },
        }
    }
}

impl MinimumSpeeds {
    /// Floor for a technology
    pub fn floor(&self, technology: Technology) -> SpeedFloor {
        match technology {
            Technology::FiveG => self.five_g,
            Technology::Lte | Technology::Other => self.lte,
        }
    }

    /// A SIM must beat both floors to meet minimums
    pub fn is_below(&self, technology: Technology, download_mbps: f64, upload_mbps: f64) -> bool {
        let floor = self.floor(technology);
        !(download_mbps > floor.download_mbps && upload_mbps > floor.upload_mbps)
    }
}

impl fmt::Display for MinimumSpeeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MIN_DOWNLOAD_SPD:{{5G:{}, LTE:{}}} MIN_UPLOAD_SPD:{{5G:{}, LTE:{}}}",
            self.five_g.download_mbps,
            self.lte.download_mbps,
            self.five_g.upload_mbps,
            self.lte.upload_mbps,
        )
    }
}

/// Custom APN entry as stored under `config/wan/custom_apns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomApn {
    /// Home carrier id (MCC+MNC)
    pub carrier: String,
    /// APN to use on that carrier
    pub apn: String,
}

impl CustomApn {
    fn new(carrier: &str, apn: &str) -> Self {
        Self { carrier: carrier.into(), apn: apn.into() }
    }

    /// Fixed carrier table
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("310030", "11200.mcs"),
            Self::new("310170", "ComcastMES5G"),
            Self::new("310030", "contingent.net"),
            Self::new("311882", "iot.tmowholesale.static"),
            Self::new("311882", "iot.tmowholesale"),
            Self::new("311480", "mw01.vzwstatic"),
            Self::new("311480", "we01.vzwstatic"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_speed_classification() {
        let mins = MinimumSpeeds::default();
        assert!(mins.is_below(Technology::FiveG, 25.0, 2.5));
        assert!(!mins.is_below(Technology::Lte, 12.0, 1.2));
        assert!(mins.is_below(Technology::Lte, 12.0, 0.8));
        assert!(!mins.is_below(Technology::Other, 10.5, 1.5));
        // floors themselves do not meet minimums
        assert!(mins.is_below(Technology::FiveG, 30.0, 5.0));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SelectorConfig =
            serde_json::from_str(r#"{"app_name": "Lab", "tie_band": 0.05}"#).unwrap();
        assert_eq!(config.app_name, "Lab");
        assert_eq!(config.tie_band, 0.05);
        assert_eq!(config.discovery_attempts, 10);
        assert_eq!(config.connection_timeout(), Duration::from_secs(420));
        assert_eq!(config.custom_apns.len(), 7);
    }
}
