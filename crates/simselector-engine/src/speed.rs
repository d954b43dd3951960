//! Throughput measurement
//!
//! [`SpeedTestRunner`] wraps a [`SpeedProbe`] with the readiness check (the
//! probe is only usable once the internet is reachable) and a bounded retry
//! when the probe comes back empty.

use crate::config::SelectorConfig;
use crate::router::InMemoryRouter;
use crate::{Result, SelectorError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Third-party throughput test; results in bits/sec
#[async_trait]
pub trait SpeedProbe: Send + Sync {
    /// Pick the test server to use for the next download/upload
    async fn select_server(&self) -> Result<()>;

    /// TCP download; `None` when nothing was transferred
    async fn download(&self) -> Result<Option<f64>>;

    /// TCP upload; `None` when nothing was transferred
    async fn upload(&self) -> Result<Option<f64>>;
}

/// Internet reachability check
#[async_trait]
pub trait Reachability: Send + Sync {
    /// True once a connection to the probe host succeeds
    async fn is_reachable(&self) -> bool;
}

/// TCP connect probe against a known host
pub struct TcpReachability {
    addr: String,
    attempt_timeout: Duration,
}

impl TcpReachability {
    /// Probe `addr` with `attempt_timeout` per connect
    pub fn new(addr: impl Into<String>, attempt_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            attempt_timeout,
        }
    }
}

#[async_trait]
impl Reachability for TcpReachability {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.attempt_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", self.addr, e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Reachability with a settable answer (for testing)
#[derive(Debug)]
pub struct FixedReachability(AtomicBool);

impl FixedReachability {
    /// Always answers `reachable`
    pub fn new(reachable: bool) -> Self {
        Self(AtomicBool::new(reachable))
    }

    /// Change the answer
    pub fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reachability for FixedReachability {
    async fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs a speed test, converting to Mbps
pub struct SpeedTestRunner {
    probe: Arc<dyn SpeedProbe>,
    reachability: Arc<dyn Reachability>,
    interval: Duration,
    timeout: Duration,
    attempts: u32,
    ready: AtomicBool,
}

impl SpeedTestRunner {
    /// Runner over `probe`, gated on `reachability`
    pub fn new(
        probe: Arc<dyn SpeedProbe>,
        reachability: Arc<dyn Reachability>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            probe,
            reachability,
            interval: config.reachability_interval(),
            timeout: config.reachability_timeout(),
            attempts: config.speedtest_attempts.max(1),
            ready: AtomicBool::new(false),
        }
    }

    /// Whether the reachability check has passed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Confirm reachability once; a failure leaves the runner unready so the
    /// next call tries again
    async fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let mut waited = Duration::ZERO;
        loop {
            if self.reachability.is_reachable().await {
                info!("Internet reachable, speed test ready");
                self.ready.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if waited >= self.timeout {
                warn!("Internet not reachable after {}s, speed test deferred", waited.as_secs());
                return Err(SelectorError::MeasurementFailure(
                    "internet unreachable, speed test deferred".into(),
                ));
            }
            tokio::time::sleep(self.interval).await;
            waited += self.interval;
        }
    }

    /// Download/upload in Mbps for whichever SIM is currently carrying traffic
    pub async fn run(&self, label: &str) -> Result<(f64, f64)> {
        self.ensure_ready().await?;

        for attempt in 1..=self.attempts {
            self.probe.select_server().await?;
            info!("Running TCP Download test on {}...", label);
            let down = self.probe.download().await?;
            info!("Running TCP Upload test on {}...", label);
            let up = self.probe.upload().await?;

            match (down, up) {
                (None, None) => {
                    warn!(attempt, "Speed test on {} returned no results", label);
                }
                (down, up) => {
                    let down = down.unwrap_or(0.0) / 1_000_000.0;
                    let up = up.unwrap_or(0.0) / 1_000_000.0;
                    info!("Speedtest complete for {}.", label);
                    return Ok((down, up));
                }
            }
        }

        Err(SelectorError::MeasurementFailure(format!(
            "speed test on {} returned no results after {} attempts",
            label, self.attempts
        )))
    }
}

/// Probe answering with per-device speeds for whichever single modem the
/// [`InMemoryRouter`] reports as connected (for testing)
pub struct InMemorySpeedProbe {
    router: Arc<InMemoryRouter>,
    speeds: RwLock<HashMap<String, (f64, f64)>>,
    empty_runs: AtomicUsize,
    downloads: AtomicUsize,
}

impl InMemorySpeedProbe {
    /// Probe with no configured speeds
    pub fn new(router: Arc<InMemoryRouter>) -> Self {
        Self {
            router,
            speeds: RwLock::new(HashMap::new()),
            empty_runs: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Speeds in Mbps reported while `uid` is the only connected modem
    pub fn with_speed(self, uid: &str, download_mbps: f64, upload_mbps: f64) -> Self {
        self.speeds.write().insert(uid.to_string(), (download_mbps, upload_mbps));
        self
    }

    /// Return nothing for the next `n` runs
    pub fn with_empty_runs(self, n: usize) -> Self {
        self.empty_runs.store(n, Ordering::SeqCst);
        self
    }

    /// Download calls made so far
    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<(f64, f64)> {
        let connected = self.router.connected_devices();
        match connected.as_slice() {
            [uid] => self.speeds.read().get(uid).copied(),
            _ => None,
        }
    }
}

#[async_trait]
impl SpeedProbe for InMemorySpeedProbe {
    async fn select_server(&self) -> Result<()> {
        Ok(())
    }

    async fn download(&self) -> Result<Option<f64>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.empty_runs.load(Ordering::SeqCst) > 0 {
            return Ok(None);
        }
        Ok(self.current().map(|(d, _)| d * 1_000_000.0))
    }

    async fn upload(&self) -> Result<Option<f64>> {
        let remaining = self.empty_runs.load(Ordering::SeqCst);
        if remaining > 0 {
            self.empty_runs.store(remaining - 1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(self.current().map(|(_, u)| u * 1_000_000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Arc<InMemoryRouter> {
        Arc::new(
            InMemoryRouter::new()
                .with_rule("r1", 1.0, "type|is|mdm%sim|is|sim1%port|is|int1")
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_converts_to_mbps() {
        let router = router();
        let probe = Arc::new(InMemorySpeedProbe::new(router).with_speed("mdm-a", 52.5, 16.25));
        let runner = SpeedTestRunner::new(probe, Arc::new(FixedReachability::new(true)), &SelectorConfig::default());

        let (down, up) = runner.run("int1 sim1").await.unwrap();
        assert!((down - 52.5).abs() < 1e-9);
        assert!((up - 16.25).abs() < 1e-9);
        assert!(runner.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_result_retried_once() {
        let router = router();
        let probe = Arc::new(InMemorySpeedProbe::new(router).with_speed("mdm-a", 20.0, 3.0).with_empty_runs(1));
        let runner = SpeedTestRunner::new(probe.clone(), Arc::new(FixedReachability::new(true)), &SelectorConfig::default());

        let (down, _) = runner.run("int1 sim1").await.unwrap();
        assert!((down - 20.0).abs() < 1e-9);
        assert_eq!(probe.download_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let router = router();
        let probe = Arc::new(InMemorySpeedProbe::new(router).with_empty_runs(10));
        let runner = SpeedTestRunner::new(probe.clone(), Arc::new(FixedReachability::new(true)), &SelectorConfig::default());

        let err = runner.run("int1 sim1").await.unwrap_err();
        assert!(matches!(err, SelectorError::MeasurementFailure(_)));
        assert_eq!(probe.download_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_defers_until_next_call() {
        let router = router();
        let probe = Arc::new(InMemorySpeedProbe::new(router).with_speed("mdm-a", 20.0, 3.0));
        let reach = Arc::new(FixedReachability::new(false));
        let runner = SpeedTestRunner::new(probe.clone(), reach.clone(), &SelectorConfig::default());

        let start = tokio::time::Instant::now();
        assert!(runner.run("int1 sim1").await.is_err());
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(probe.download_calls(), 0);
        assert!(!runner.is_ready());

        reach.set(true);
        assert!(runner.run("int1 sim1").await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_reachability_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(TcpReachability::new(addr, Duration::from_secs(1)).is_reachable().await);
    }
}
