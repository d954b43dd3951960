//! Notifications
//!
//! Messages go to any combination of the local log, the management-cloud
//! alert channel and the device description field. Alerts raised while the
//! cloud channel is down are buffered newest-first and flushed oldest-first
//! once it is back. An alert that fails during a flush stays buffered.

use crate::clock::Clock;
use crate::router::{get_string, paths, RouterConfigClient};
use crate::store::StateStore;
use crate::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::{info, warn};

const PENDING_KEY: &str = "pending_notifications";

/// Delivery channel bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channels(u8);

impl Channels {
    /// Local log
    pub const LOG: Channels = Channels(1);
    /// Management-cloud alert
    pub const ALERT: Channels = Channels(2);
    /// Device description field
    pub const DESCRIPTION: Channels = Channels(4);
    /// Log + alert
    pub const NOTIFY: Channels = Channels(3);
    /// Log + description
    pub const TRACK: Channels = Channels(5);
    /// Alert + description
    pub const SIGNAL: Channels = Channels(6);
    /// Everything
    pub const SYNC: Channels = Channels(7);

    /// From raw bits; unknown bits are dropped
    pub fn from_bits(bits: u8) -> Self {
        Channels(bits & 7)
    }

    /// Raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Every bit of `other` is set
    pub fn contains(&self, other: Channels) -> bool {
        self.0 & other.0 == other.0
    }

    fn without(self, other: Channels) -> Self {
        Channels(self.0 & !other.0)
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Channels {
    type Output = Channels;

    fn bitor(self, rhs: Channels) -> Channels {
        Channels(self.0 | rhs.0)
    }
}

/// Log / alert / description writer provided by the host
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Local log line; never needs connectivity
    async fn log(&self, message: &str);

    /// Management-cloud alert
    async fn alert(&self, message: &str) -> Result<()>;

    /// Replace the device description field
    async fn set_description(&self, text: &str) -> Result<()>;
}

/// Sink that records everything (for testing)
#[derive(Default)]
pub struct InMemorySink {
    logs: RwLock<Vec<String>>,
    alerts: RwLock<Vec<String>>,
    descriptions: RwLock<Vec<String>>,
}

impl InMemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded log lines
    pub fn logs(&self) -> Vec<String> {
        self.logs.read().clone()
    }

    /// Recorded alerts, in delivery order
    pub fn alerts(&self) -> Vec<String> {
        self.alerts.read().clone()
    }

    /// Recorded description writes
    pub fn descriptions(&self) -> Vec<String> {
        self.descriptions.read().clone()
    }
}

#[async_trait]
impl NotificationSink for InMemorySink {
    async fn log(&self, message: &str) {
        self.logs.write().push(message.to_string());
    }

    async fn alert(&self, message: &str) -> Result<()> {
        self.alerts.write().push(message.to_string());
        Ok(())
    }

    async fn set_description(&self, text: &str) -> Result<()> {
        self.descriptions.write().push(text.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pending {
    channels: Channels,
    message: String,
}

/// Fans messages out to a [`NotificationSink`], buffering while offline
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    router: Arc<dyn RouterConfigClient>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn StateStore>>,
    app_name: String,
    description_limit: usize,
    buffer_limit: usize,
    pending: Mutex<VecDeque<Pending>>,
    last_description: RwLock<Option<String>>,
}

impl Notifier {
    /// Notifier with the default limits and no persistence
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        router: Arc<dyn RouterConfigClient>,
        clock: Arc<dyn Clock>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            router,
            clock,
            store: None,
            app_name: app_name.into(),
            description_limit: 1023,
            buffer_limit: 25,
            pending: Mutex::new(VecDeque::new()),
            last_description: RwLock::new(None),
        }
    }

    /// Persist the offline buffer so it survives a reboot
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Description byte limit and offline buffer size
    pub fn with_limits(mut self, description_limit: usize, buffer_limit: usize) -> Self {
        self.description_limit = description_limit;
        self.buffer_limit = buffer_limit.max(1);
        self
    }

    /// Prefix used by [`Notifier::notify`]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Reload a buffer persisted by a previous process
    pub async fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let restored: Vec<Pending> = match store.get(PENDING_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => return Ok(()),
        };
        if !restored.is_empty() {
            info!(count = restored.len(), "Restored buffered notifications");
        }
        *self.pending.lock() = restored.into_iter().collect();
        Ok(())
    }

    /// Send `message` (prefixed with the app name) to `channels`
    pub async fn notify(&self, channels: Channels, message: &str) {
        self.send(channels, &format!("{}: {}", self.app_name, message)).await
    }

    /// Send `message` as-is to `channels`
    pub async fn send(&self, channels: Channels, message: &str) {
        if channels.contains(Channels::LOG) {
            self.sink.log(message).await;
        }

        if channels.contains(Channels::DESCRIPTION) {
            self.describe(message).await;
        }

        let remote = channels.without(Channels::LOG).without(Channels::DESCRIPTION);
        if remote.is_empty() {
            return;
        }

        if self.is_online().await {
            self.flush().await;
            let _ = self.deliver(remote, message).await;
        } else {
            let stamped = format!(
                "[offline {}] {}",
                self.clock.now().format("%m/%d/%y %H:%M:%S"),
                message
            );
            self.buffer(Pending { channels: remote, message: stamped }).await;
        }
    }

    /// Write the description field verbatim (truncated to the field limit)
    pub async fn describe(&self, text: &str) {
        let text = truncate_to_bytes(text, self.description_limit);
        *self.last_description.write() = Some(text.to_string());
        if let Err(e) = self.sink.set_description(text).await {
            warn!("Failed to write description: {}", e);
        }
    }

    /// Last description written by this process
    pub fn last_description(&self) -> Option<String> {
        self.last_description.read().clone()
    }

    /// Deliver buffered messages oldest-first.
    ///
    /// Delivery stops at the first failed alert; it and everything newer go
    /// back into the buffer in their original order.
    pub async fn flush(&self) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock();
            pending.drain(..).rev().collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Flushing buffered notifications");

        let mut sent = 0;
        for entry in &drained {
            if !self.deliver(entry.channels, &entry.message).await {
                break;
            }
            sent += 1;
        }
        if sent < drained.len() {
            warn!(left = drained.len() - sent, "Flush interrupted, keeping the rest buffered");
            let mut pending = self.pending.lock();
            // entries buffered during the flush are newer and stay in front
            for entry in drained.into_iter().skip(sent).rev() {
                pending.push_back(entry);
            }
            pending.truncate(self.buffer_limit);
        }
        self.persist().await;
    }

    /// Buffered message count
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// False when the alert could not be handed to the sink
    async fn deliver(&self, channels: Channels, message: &str) -> bool {
        if channels.contains(Channels::ALERT) {
            if let Err(e) = self.sink.alert(message).await {
                warn!("Failed to send alert: {}", e);
                return false;
            }
        }
        true
    }

    async fn buffer(&self, entry: Pending) {
        {
            let mut pending = self.pending.lock();
            pending.push_front(entry);
            pending.truncate(self.buffer_limit);
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot: Vec<Pending> = self.pending.lock().iter().cloned().collect();
        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode notification buffer: {}", e);
                return;
            }
        };
        if let Err(e) = store.set(PENDING_KEY, value).await {
            warn!("Failed to persist notification buffer: {}", e);
        }
    }

    async fn is_online(&self) -> bool {
        matches!(
            get_string(self.router.as_ref(), paths::ECM_STATE).await,
            Ok(Some(state)) if state == "connected"
        )
    }
}

/// Longest prefix of `s` within `limit` bytes that ends on a char boundary
pub fn truncate_to_bytes(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
