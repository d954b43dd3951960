//! Daemon Configuration

use serde::{Deserialize, Serialize};
use simselector_engine::SelectorConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SIMSELECTOR_CONFIG";

/// Config file used when none is named
pub const DEFAULT_CONFIG_PATH: &str = "/etc/simselector/edge.json";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Router local API
    pub router: RouterApiConfig,
    /// Speed-test servers and transfer sizes
    pub speedtest: SpeedtestConfig,
    /// Persisted phase and buffered alerts
    pub state_path: PathBuf,
    /// Description-field poll interval
    pub trigger_poll_ms: u64,
    /// Seconds the router WAN gets to come up at start before rules are re-enabled
    pub boot_wan_timeout_secs: u64,
    /// Engine settings
    pub selector: SelectorConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            router: RouterApiConfig::default(),
            speedtest: SpeedtestConfig::default(),
            state_path: PathBuf::from("/data/simselector_state.json"),
            trigger_poll_ms: 1000,
            boot_wan_timeout_secs: 100,
            selector: SelectorConfig::default(),
        }
    }
}

impl EdgeConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Description-field poll interval
    pub fn trigger_poll(&self) -> Duration {
        Duration::from_millis(self.trigger_poll_ms.max(1))
    }

    /// Boot WAN wait before rules are re-enabled
    pub fn boot_wan_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_wan_timeout_secs)
    }
}

/// Router local config API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterApiConfig {
    /// Base URL; tree paths are appended after `/api/`
    pub base_url: String,
    /// Basic-auth user
    pub username: String,
    /// Basic-auth password; none sends the user only
    pub password: Option<String>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for RouterApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".into(),
            username: "admin".into(),
            password: None,
            request_timeout_secs: 30,
        }
    }
}

/// Legacy HTTP speed-test protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedtestConfig {
    /// Server directories, each serving `latency.txt`, `random<N>x<N>.jpg` and `upload.php`
    pub servers: Vec<String>,
    /// Image edge lengths fetched during the download test
    pub download_sizes: Vec<u32>,
    /// Payload sizes in bytes posted during the upload test
    pub upload_sizes: Vec<usize>,
    /// Latency samples per server
    pub latency_samples: usize,
    /// Per-transfer timeout
    pub transfer_timeout_secs: u64,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "http://speedtest.tds.net/speedtest".into(),
                "http://speedtest.sea1.nitelusa.net/speedtest".into(),
            ],
            download_sizes: vec![350, 500, 750, 1000, 1500, 2000],
            upload_sizes: vec![262_144, 524_288, 1_048_576, 2_097_152],
            latency_samples: 3,
            transfer_timeout_secs: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EdgeConfig = serde_json::from_str(
            r#"{"router": {"password": "secret"}, "selector": {"min_sims": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.router.base_url, "http://127.0.0.1");
        assert_eq!(config.router.password.as_deref(), Some("secret"));
        assert_eq!(config.selector.min_sims, 3);
        assert_eq!(config.selector.connection_timeout_secs, 420);
        assert_eq!(config.state_path, PathBuf::from("/data/simselector_state.json"));
        assert_eq!(config.speedtest.latency_samples, 3);
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("simselector-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("edge.json");
        let path = path.to_str().unwrap();

        let mut config = EdgeConfig::default();
        config.trigger_poll_ms = 250;
        config.save(path).unwrap();

        let loaded = EdgeConfig::load(path).unwrap();
        assert_eq!(loaded.trigger_poll(), Duration::from_millis(250));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(EdgeConfig::load("/nonexistent/simselector.json").is_err());
    }
}
