//! WAN rule table operations

use crate::dedup::round_priority;
use crate::router::{get_as, paths, value_to_f64, value_to_string, RouterConfigClient};
use crate::{Result, SelectorError};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Enable/disable and priority writes against `config/wan/rules2`
pub struct WanRuleTable {
    router: Arc<dyn RouterConfigClient>,
    settle: Duration,
    step: f64,
}

impl WanRuleTable {
    /// Table writes settle for `settle`; ranked priorities are `step` apart
    pub fn new(router: Arc<dyn RouterConfigClient>, settle: Duration, step: f64) -> Self {
        Self { router, settle, step }
    }

    /// Current rules in table order
    pub async fn list(&self) -> Result<Vec<Value>> {
        Ok(get_as(self.router.as_ref(), paths::WAN_RULES).await?.unwrap_or_default())
    }

    /// Rule with this id or index is present
    pub async fn exists(&self, rule_id: &str) -> Result<bool> {
        Ok(self.router.get(&paths::rule(rule_id)).await?.is_some())
    }

    /// Flip one rule's `disabled` flag; a missing rule is an error
    pub async fn set_disabled(&self, rule_id: &str, disabled: bool) -> Result<()> {
        debug!(rule_id, disabled, "Setting rule state");
        if !self
            .router
            .put(&paths::rule_field(rule_id, "disabled"), json!(disabled))
            .await?
        {
            return Err(SelectorError::Router(format!("WAN rule {} not found", rule_id)));
        }
        Ok(())
    }

    /// Set every rule's `disabled` flag, then let the router apply it
    pub async fn set_all_disabled(&self, disabled: bool) -> Result<()> {
        let count = self.list().await?.len();
        for index in 0..count {
            self.router
                .put(&paths::rule_field(&index.to_string(), "disabled"), json!(disabled))
                .await?;
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Disable every rule
    pub async fn disable_all(&self) -> Result<()> {
        self.set_all_disabled(true).await
    }

    /// Enable every rule
    pub async fn enable_all(&self) -> Result<()> {
        self.set_all_disabled(false).await
    }

    /// Rewrite priorities so `ranked` (best first) sort lowest, starting from
    /// the lowest priority currently held by any of them.
    ///
    /// The whole plan is resolved before the first write, so a missing rule
    /// leaves the table untouched.
    pub async fn rewrite_priorities(&self, ranked: &[String]) -> Result<Vec<(String, f64)>> {
        let mut current = Vec::with_capacity(ranked.len());
        for rule_id in ranked {
            let priority = self
                .router
                .get(&paths::rule_field(rule_id, "priority"))
                .await?
                .as_ref()
                .and_then(value_to_f64)
                .ok_or_else(|| SelectorError::Router(format!("WAN rule {} has no priority", rule_id)))?;
            current.push(priority);
        }
        let lowest = current.iter().copied().fold(f64::INFINITY, f64::min);

        let plan: Vec<(String, f64)> = ranked
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), round_priority(lowest + i as f64 * self.step)))
            .collect();

        for (rule_id, priority) in &plan {
            info!("New priority for rule {} = {}", rule_id, priority);
            self.router
                .put(&paths::rule_field(rule_id, "priority"), json!(priority))
                .await?;
        }
        Ok(plan)
    }

    /// Enable the lowest-priority rule per physical port and disable the rest.
    ///
    /// `port_of_rule` maps candidate rule ids to their SIM's port; any other
    /// rule is its own group. Returns the enabled rule ids.
    pub async fn commit_per_port(&self, port_of_rule: &HashMap<String, String>) -> Result<Vec<String>> {
        let mut rules: Vec<(String, f64)> = self
            .list()
            .await?
            .iter()
            .filter_map(|r| {
                let id = r.get("_id_").and_then(value_to_string)?;
                let priority = r.get("priority").and_then(value_to_f64).unwrap_or(f64::MAX);
                Some((id, priority))
            })
            .collect();
        rules.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut seen: HashSet<&str> = HashSet::new();
        let mut enabled = Vec::new();
        for (rule_id, _) in &rules {
            let group = port_of_rule.get(rule_id).map(String::as_str).unwrap_or(rule_id);
            let first = seen.insert(group);
            self.set_disabled(rule_id, !first).await?;
            if first {
                enabled.push(rule_id.clone());
            }
        }
        tokio::time::sleep(self.settle).await;
        Ok(enabled)
    }
}
