//! Legacy HTTP speed-test probe
//!
//! A server is a directory serving `latency.txt` (body `test=test`),
//! `random<N>x<N>.jpg` images and an `upload.php` sink. Latency picks the
//! server; transfers run concurrently and the total is divided by the wall
//! time of the whole batch.

use crate::config::SpeedtestConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use simselector_engine::{SelectorError, SpeedProbe};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type Result<T> = simselector_engine::Result<T>;

const UPLOAD_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// [`SpeedProbe`] over plain HTTP transfers
pub struct HttpSpeedProbe {
    client: reqwest::Client,
    servers: Vec<String>,
    download_sizes: Vec<u32>,
    upload_sizes: Vec<usize>,
    latency_samples: usize,
    best: RwLock<Option<String>>,
}

impl HttpSpeedProbe {
    /// Probe over the configured servers
    pub fn new(config: &SpeedtestConfig) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.transfer_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            servers: config
                .servers
                .iter()
                .map(|s| s.trim_end_matches('/').to_string())
                .collect(),
            download_sizes: config.download_sizes.clone(),
            upload_sizes: config.upload_sizes.clone(),
            latency_samples: config.latency_samples.max(1),
            best: RwLock::new(None),
        })
    }

    /// Server picked by the last [`SpeedProbe::select_server`]
    pub fn selected(&self) -> Option<String> {
        self.best.read().clone()
    }

    /// Median round trip to `latency.txt`; `None` if any sample fails
    async fn latency(&self, server: &str) -> Option<Duration> {
        let url = format!("{}/latency.txt", server);
        let mut samples = Vec::with_capacity(self.latency_samples);
        for _ in 0..self.latency_samples {
            let started = Instant::now();
            let resp = self.client.get(&url).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let body = resp.text().await.ok()?;
            if body.trim() != "test=test" {
                return None;
            }
            samples.push(started.elapsed());
        }
        samples.sort();
        samples.get(samples.len() / 2).copied()
    }

    async fn server(&self) -> Result<String> {
        if let Some(server) = self.selected() {
            return Ok(server);
        }
        self.select_server().await?;
        self.selected()
            .ok_or_else(|| SelectorError::MeasurementFailure("no speed-test server selected".into()))
    }
}

#[async_trait]
impl SpeedProbe for HttpSpeedProbe {
    async fn select_server(&self) -> Result<()> {
        let mut best: Option<(Duration, &String)> = None;
        for server in &self.servers {
            match self.latency(server).await {
                Some(latency) => {
                    debug!("{} latency {:?}", server, latency);
                    if best.map(|(b, _)| latency < b).unwrap_or(true) {
                        best = Some((latency, server));
                    }
                }
                None => debug!("{} did not answer the latency test", server),
            }
        }

        let Some((latency, server)) = best else {
            return Err(SelectorError::MeasurementFailure(
                "no speed-test server answered".into(),
            ));
        };
        info!("Selected speed-test server {} ({:?})", server, latency);
        *self.best.write() = Some(server.clone());
        Ok(())
    }

    async fn download(&self) -> Result<Option<f64>> {
        let server = self.server().await?;
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for size in &self.download_sizes {
            let client = self.client.clone();
            let url = format!("{}/random{}x{}.jpg", server, size, size);
            tasks.spawn(async move { fetch(&client, &url).await });
        }
        let bytes = total(&mut tasks).await;
        Ok(bits_per_second(bytes, started.elapsed()))
    }

    async fn upload(&self) -> Result<Option<f64>> {
        let server = self.server().await?;
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for size in &self.upload_sizes {
            let client = self.client.clone();
            let url = format!("{}/upload.php", server);
            let payload = upload_payload(*size);
            tasks.spawn(async move { push(&client, &url, payload).await });
        }
        let bytes = total(&mut tasks).await;
        Ok(bits_per_second(bytes, started.elapsed()))
    }
}

/// Bytes received from one GET; zero on failure
async fn fetch(client: &reqwest::Client, url: &str) -> u64 {
    let mut resp = match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            warn!("GET {} returned {}", url, resp.status());
            return 0;
        }
        Err(e) => {
            warn!("GET {} failed: {}", url, e);
            return 0;
        }
    };

    let mut received = 0u64;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => received += chunk.len() as u64,
            Ok(None) => break,
            Err(e) => {
                warn!("Download from {} interrupted: {}", url, e);
                break;
            }
        }
    }
    received
}

/// Bytes accepted by one POST; zero on failure
async fn push(client: &reqwest::Client, url: &str, payload: Vec<u8>) -> u64 {
    let len = payload.len() as u64;
    match client.post(url).body(payload).send().await {
        Ok(resp) if resp.status().is_success() => len,
        Ok(resp) => {
            warn!("POST {} returned {}", url, resp.status());
            0
        }
        Err(e) => {
            warn!("POST {} failed: {}", url, e);
            0
        }
    }
}

async fn total(tasks: &mut JoinSet<u64>) -> u64 {
    let mut bytes = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(n) => bytes += n,
            Err(e) => warn!("Transfer task failed: {}", e),
        }
    }
    bytes
}

/// `content1=` followed by the alphabet repeated out to `size` bytes
fn upload_payload(size: usize) -> Vec<u8> {
    let prefix = b"content1=";
    let mut payload = Vec::with_capacity(size.max(prefix.len()));
    payload.extend_from_slice(prefix);
    payload.extend(UPLOAD_ALPHABET.iter().copied().cycle().take(size.saturating_sub(prefix.len())));
    payload
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> Option<f64> {
    if bytes == 0 {
        return None;
    }
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    Some(bytes as f64 * 8.0 / secs)
}
