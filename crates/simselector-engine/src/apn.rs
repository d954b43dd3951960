//! Carrier APN hygiene
//!
//! Keeps the fixed carrier→APN table merged into `config/wan/custom_apns` and
//! removes manually pinned APNs from WAN rules so the modem falls back to
//! automatic selection over that table.

use crate::config::CustomApn;
use crate::notify::{Channels, Notifier};
use crate::router::{get_as, paths, RouterConfigClient};
use crate::Result;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Fixed carrier→APN table
#[derive(Debug, Clone)]
pub struct ApnCatalog {
    entries: Vec<CustomApn>,
}

impl ApnCatalog {
    /// Catalog over `entries`
    pub fn new(entries: Vec<CustomApn>) -> Self {
        Self { entries }
    }

    /// Entries for one home carrier id
    pub fn for_carrier<'a>(&'a self, carrier: &'a str) -> impl Iterator<Item = &'a CustomApn> + 'a {
        self.entries.iter().filter(move |e| e.carrier == carrier)
    }

    /// Append missing catalog entries to the router's custom APN list
    pub async fn ensure_custom_apns(&self, router: &dyn RouterConfigClient) -> Result<bool> {
        self.merge(router, self.entries.iter()).await
    }

    /// Corrective action for a SIM that never connected: make its carrier's
    /// alternates available and drop any pinned APN on its rule
    pub async fn apply_alternates(
        &self,
        router: &dyn RouterConfigClient,
        notifier: &Notifier,
        carrier: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<bool> {
        let mut changed = false;
        if let Some(carrier) = carrier {
            if self.merge(router, self.for_carrier(carrier)).await? {
                notifier.notify(Channels::SYNC, "Custom APNs were updated").await;
                changed = true;
            }
        }
        if let Some(rule_id) = rule_id {
            if let Some(rule) = router.get(&paths::rule(rule_id)).await? {
                if is_manual(&rule) {
                    clear_rule_apn(router, notifier, rule_id, &rule).await?;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Clear manual APN settings on every WAN rule, returning the rule ids touched
    pub async fn clear_manual_apns(
        &self,
        router: &dyn RouterConfigClient,
        notifier: &Notifier,
    ) -> Result<Vec<String>> {
        let rules: Vec<Value> = get_as(router, paths::WAN_RULES).await?.unwrap_or_default();
        let mut touched = Vec::new();
        for rule in rules.iter().filter(|r| is_manual(r)) {
            let Some(id) = rule.get("_id_").and_then(Value::as_str) else {
                continue;
            };
            clear_rule_apn(router, notifier, id, rule).await?;
            touched.push(id.to_string());
        }
        Ok(touched)
    }

    async fn merge<'a>(
        &self,
        router: &dyn RouterConfigClient,
        wanted: impl Iterator<Item = &'a CustomApn>,
    ) -> Result<bool> {
        let current: Option<Vec<Value>> = get_as(router, paths::CUSTOM_APNS).await?;
        let absent = current.as_ref().map(|c| c.is_empty()).unwrap_or(true);
        let mut merged = current.unwrap_or_default();
        let before = merged.len();

        for entry in wanted {
            let value = serde_json::to_value(entry)?;
            if !merged.contains(&value) {
                merged.push(value);
            }
        }

        if merged.len() == before {
            debug!("Custom APN list already complete");
            return Ok(false);
        }
        info!(added = merged.len() - before, created = absent, "Updating custom APN list");
        router.put(paths::CUSTOM_APNS, Value::Array(merged)).await?;
        Ok(true)
    }
}

fn is_manual(rule: &Value) -> bool {
    match rule.get("modem").and_then(Value::as_object) {
        Some(modem) => {
            modem.contains_key("manual_apn")
                || modem.get("apn_mode").and_then(Value::as_str) == Some("manual")
        }
        None => false,
    }
}

async fn clear_rule_apn(
    router: &dyn RouterConfigClient,
    notifier: &Notifier,
    rule_id: &str,
    rule: &Value,
) -> Result<()> {
    let manual = rule
        .pointer("/modem/manual_apn")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if manual.is_empty() {
        router.delete(&paths::rule_field(rule_id, "modem/apn_mode")).await?;
        router.delete(&paths::rule_field(rule_id, "modem/manual_apn")).await?;
        let modem = router.get(&paths::rule_field(rule_id, "modem")).await?;
        if modem == Some(json!({})) {
            router.delete(&paths::rule_field(rule_id, "modem")).await?;
        }
        notifier
            .notify(
                Channels::SYNC,
                &format!(
                    "APN Mode Updated on Rule Id: {}. Group configuration might require updates.",
                    rule_id
                ),
            )
            .await;
    } else {
        router.put(&paths::rule_field(rule_id, "modem/manual_apn"), json!("")).await?;
        notifier
            .notify(
                Channels::SYNC,
                &format!(
                    "Manual APN has been cleared on Rule Id: {}. Group configuration might require updates.",
                    rule_id
                ),
            )
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::InMemorySink;
    use crate::router::InMemoryRouter;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryRouter>, Arc<InMemorySink>, Notifier) {
        let router = Arc::new(
            InMemoryRouter::new()
                .with_rule("r1", 1.0, "type|is|mdm%sim|is|sim1%port|is|int1")
                .with_rule("r2", 1.1, "type|is|mdm%sim|is|sim2%port|is|int1"),
        );
        let sink = Arc::new(InMemorySink::new());
        let notifier = Notifier::new(sink.clone(), router.clone(), Arc::new(SystemClock), "SimSelector");
        (router, sink, notifier)
    }

    #[tokio::test]
    async fn test_merge_custom_apns() {
        let (router, _, _) = setup();
        router.set_value(
            paths::CUSTOM_APNS,
            json!([{"carrier": "310030", "apn": "11200.mcs"}, {"carrier": "999", "apn": "lab"}]),
        );
        let catalog = ApnCatalog::new(CustomApn::defaults());

        assert!(catalog.ensure_custom_apns(router.as_ref()).await.unwrap());
        let list = router.value(paths::CUSTOM_APNS).unwrap();
        assert_eq!(list.as_array().unwrap().len(), 8);
        assert_eq!(list[1], json!({"carrier": "999", "apn": "lab"}));

        assert!(!catalog.ensure_custom_apns(router.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_manual_apns() {
        let (router, sink, notifier) = setup();
        router.set_value("config/wan/rules2/r1/modem", json!({"apn_mode": "manual", "manual_apn": ""}));
        router.set_value("config/wan/rules2/r2/modem", json!({"manual_apn": "broadband", "mtu": 1428}));

        let catalog = ApnCatalog::new(CustomApn::defaults());
        let touched = catalog.clear_manual_apns(router.as_ref(), &notifier).await.unwrap();

        assert_eq!(touched, vec!["r1", "r2"]);
        assert!(router.value("config/wan/rules2/r1/modem").is_none());
        assert_eq!(router.value("config/wan/rules2/r2/modem/manual_apn"), Some(json!("")));
        assert_eq!(sink.alerts().len(), 2);
        assert!(sink.alerts()[1].contains("Manual APN has been cleared on Rule Id: r2"));
    }

    #[tokio::test]
    async fn test_alternates_for_carrier() {
        let (router, sink, notifier) = setup();
        let catalog = ApnCatalog::new(CustomApn::defaults());

        let changed = catalog
            .apply_alternates(router.as_ref(), &notifier, Some("311480"), Some("r1"))
            .await
            .unwrap();
        assert!(changed);
        let list = router.value(paths::CUSTOM_APNS).unwrap();
        assert_eq!(list.as_array().unwrap().len(), 2);
        assert!(sink.alerts()[0].ends_with("Custom APNs were updated"));
    }
}
