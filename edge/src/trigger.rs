//! Description-field trigger
//!
//! Operators start a run from the cloud by typing into the router's
//! description field: `start` runs from the persisted phase, `force`
//! restarts from validation regardless of uptime, `reset` restarts from
//! validation. Clearing the field behaves like `start`. Text this process
//! wrote itself (reports, digests, prompts) never triggers anything.

use parking_lot::Mutex;
use serde_json::json;
use simselector_engine::router::{get_string, paths};
use simselector_engine::{Notifier, RouterConfigClient, RunCommand};
use std::sync::Arc;
use tracing::{debug, info};

type Result<T> = simselector_engine::Result<T>;

/// Command carried by a description value, if any
pub fn classify(desc: &str) -> Option<RunCommand> {
    let desc = desc.to_ascii_lowercase();
    if desc.contains("reset") {
        Some(RunCommand::Reset)
    } else if desc.contains("force") {
        Some(RunCommand::Force)
    } else if desc.contains("start") {
        Some(RunCommand::Start)
    } else {
        None
    }
}

/// Polls `config/system/desc` for operator commands
pub struct DescriptionTrigger {
    router: Arc<dyn RouterConfigClient>,
    notifier: Arc<Notifier>,
    last_seen: Mutex<Option<String>>,
}

impl DescriptionTrigger {
    /// Trigger that ignores what `notifier` wrote
    pub fn new(router: Arc<dyn RouterConfigClient>, notifier: Arc<Notifier>) -> Self {
        Self {
            router,
            notifier,
            last_seen: Mutex::new(None),
        }
    }

    /// Read the field once; returns a command when it changed to one.
    ///
    /// The first poll treats whatever is already there as new, except an
    /// empty field.
    pub async fn poll(&self) -> Result<Option<RunCommand>> {
        let desc = get_string(self.router.as_ref(), paths::DESCRIPTION)
            .await?
            .unwrap_or_default();

        let previous = self.last_seen.lock().replace(desc.clone());
        if previous.as_deref() == Some(desc.as_str()) {
            return Ok(None);
        }
        if self.notifier.last_description().as_deref() == Some(desc.as_str()) {
            debug!("Ignoring description written by this process");
            return Ok(None);
        }
        let command = if desc.trim().is_empty() {
            match previous {
                Some(previous) if !previous.trim().is_empty() => {
                    info!("Description cleared");
                    Some(RunCommand::Start)
                }
                _ => None,
            }
        } else {
            classify(&desc)
        };
        if let Some(command) = command {
            info!(?command, "Run requested from description field");
            let stamp = format!("{} Enabled", self.notifier.app_name());
            self.router.put(paths::ASSET_ID, json!(stamp)).await?;
        }
        Ok(command)
    }
}
