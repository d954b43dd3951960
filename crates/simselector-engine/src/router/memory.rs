//! In-memory router config tree (for testing and offline simulation)
//!
//! Models the parts of the router platform the engine relies on: rules in
//! `config/wan/rules2` addressable by index or `_id_`, modem devices bound to
//! the most specific matching rule, connection state following the bound
//! rule's `disabled` flag, and the ECM control channel.

use super::{value_to_f64, RouterConfigClient};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Rule table after one write: `(rule id, disabled)` in table order
pub type RuleSnapshot = Vec<(String, bool)>;

/// In-memory router
pub struct InMemoryRouter {
    state: RwLock<RouterState>,
}

struct RouterState {
    tree: Value,
    unreachable: HashSet<String>,
    cloud_offline: bool,
    journal: Vec<RuleSnapshot>,
    next_rule: u64,
}

impl InMemoryRouter {
    /// Router with no WAN devices or rules, WAN and ECM connected
    pub fn new() -> Self {
        let tree = json!({
            "status": {
                "wan": {
                    "devices": {},
                    "connection_state": "connected",
                    "primary_device": "",
                },
                "ecm": { "state": "connected", "sync": "ready", "client_id": 1000 },
                "system": { "uptime": 60 },
                "product_info": { "product_name": "IBR1700-600M" },
            },
            "config": {
                "wan": {
                    "rules2": [],
                    "dual_sim_disable_mask": "",
                    "rem_dual_sim_disable_mask": "",
                },
                "system": { "desc": "", "asset_id": "", "system_id": "IBR1700-lab" },
            },
            "control": { "ecm": {}, "system": { "sdk": {} } },
        });

        Self {
            state: RwLock::new(RouterState {
                tree,
                unreachable: HashSet::new(),
                cloud_offline: false,
                journal: Vec::new(),
                next_rule: 1,
            }),
        }
    }

    /// Add a WAN rule
    pub fn with_rule(self, id: &str, priority: f64, trigger_string: &str) -> Self {
        {
            let mut state = self.state.write();
            if let Some(rules) = state.tree.pointer_mut("/config/wan/rules2").and_then(Value::as_array_mut) {
                rules.push(json!({
                    "_id_": id,
                    "priority": priority,
                    "disabled": false,
                    "trigger_name": id,
                    "trigger_string": trigger_string,
                }));
            }
            state.refresh();
        }
        self
    }

    /// Add a modem with a diagnostics snapshot
    pub fn with_modem(
        self,
        uid: &str,
        port: &str,
        sim: &str,
        tech: &str,
        rsrp: Option<f64>,
        carrier: &str,
    ) -> Self {
        let device = json!({
            "info": { "port": port, "sim": sim, "tech": tech },
            "status": { "connection_state": "disconnected", "error_text": "" },
            "diagnostics": {
                "RSRP": rsrp,
                "HOMECARRID": carrier,
                "RFBAND": "Band 66",
                "PRD": format!("Carrier-{}", carrier),
            },
        });
        self.with_device(uid, device)
    }

    /// Add a raw WAN device status node
    pub fn with_device(self, uid: &str, device: Value) -> Self {
        {
            let mut state = self.state.write();
            if let Some(devices) = state.tree.pointer_mut("/status/wan/devices").and_then(Value::as_object_mut) {
                devices.insert(uid.to_string(), device);
            }
            state.refresh();
        }
        self
    }

    /// Device never reaches `connected`
    pub fn set_unreachable(&self, uid: &str, unreachable: bool) {
        let mut state = self.state.write();
        if unreachable {
            state.unreachable.insert(uid.to_string());
        } else {
            state.unreachable.remove(uid);
        }
        state.refresh();
    }

    /// ECM ignores start commands while offline
    pub fn set_cloud_offline(&self, offline: bool) {
        let mut state = self.state.write();
        state.cloud_offline = offline;
        if offline {
            state.set_ecm("disconnected", "not_ready");
        }
    }

    /// Write a node directly
    pub fn set_value(&self, path: &str, value: Value) {
        let mut state = self.state.write();
        state.write(path, value);
        state.after_write(path);
    }

    /// Read a node directly
    pub fn value(&self, path: &str) -> Option<Value> {
        self.state.read().lookup(path)
    }

    /// Current rule table
    pub fn rules(&self) -> Vec<Value> {
        self.state
            .read()
            .tree
            .pointer("/config/wan/rules2")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Rule table snapshot after every rule write, oldest first
    pub fn journal(&self) -> Vec<RuleSnapshot> {
        self.state.read().journal.clone()
    }

    /// Modems currently connected
    pub fn connected_devices(&self) -> Vec<String> {
        let state = self.state.read();
        let Some(devices) = state.tree.pointer("/status/wan/devices").and_then(Value::as_object) else {
            return Vec::new();
        };
        devices
            .iter()
            .filter(|(_, d)| d.pointer("/status/connection_state").and_then(Value::as_str) == Some("connected"))
            .map(|(uid, _)| uid.clone())
            .collect()
    }
}

impl Default for InMemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterConfigClient for InMemoryRouter {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.state.read().lookup(path))
    }

    async fn put(&self, path: &str, value: Value) -> Result<bool> {
        let mut state = self.state.write();
        let ok = state.write(path, value);
        if ok {
            state.after_write(path);
        }
        Ok(ok)
    }

    async fn post(&self, path: &str, mut value: Value) -> Result<Value> {
        let mut state = self.state.write();
        let id = format!("00000000-0000-4000-8000-{:012x}", state.next_rule);
        state.next_rule += 1;

        let Some(Value::Array(items)) = navigate(&mut state.tree, &segments(path), false) else {
            return Err(crate::SelectorError::Router(format!("cannot post to {}", path)));
        };
        if let Some(obj) = value.as_object_mut() {
            obj.entry("_id_").or_insert_with(|| json!(id));
        }
        items.push(value);
        let index = items.len() - 1;
        state.after_write(path);
        Ok(json!(index))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut state = self.state.write();
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            return Ok(false);
        };
        let removed = match navigate(&mut state.tree, parents, false) {
            Some(Value::Object(map)) => map.remove(*last).is_some(),
            Some(Value::Array(items)) => match position(items, last) {
                Some(i) => {
                    items.remove(i);
                    true
                }
                None => false,
            },
            _ => false,
        };
        if removed {
            state.after_write(path);
        }
        Ok(removed)
    }
}

impl RouterState {
    fn lookup(&self, path: &str) -> Option<Value> {
        let mut node = &self.tree;
        for seg in segments(path) {
            node = child(node, seg)?;
        }
        Some(node.clone())
    }

    fn write(&mut self, path: &str, value: Value) -> bool {
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            self.tree = value;
            return true;
        };
        if parents == ["control"] && *last == "ecm" {
            self.apply_ecm_control(&value);
        }
        match navigate(&mut self.tree, parents, true) {
            Some(Value::Object(map)) => {
                map.insert(last.to_string(), value);
                true
            }
            Some(Value::Array(items)) => match position(items, last) {
                Some(i) => {
                    items[i] = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn after_write(&mut self, path: &str) {
        self.refresh();
        if segments(path).starts_with(&["config", "wan", "rules2"]) {
            let snapshot = self
                .tree
                .pointer("/config/wan/rules2")
                .and_then(Value::as_array)
                .map(|rules| {
                    rules
                        .iter()
                        .map(|r| (rule_id(r).unwrap_or_default().to_string(), rule_disabled(r)))
                        .collect()
                })
                .unwrap_or_default();
            self.journal.push(snapshot);
        }
    }

    fn apply_ecm_control(&mut self, command: &Value) {
        let flag = |key: &str| match command.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if flag("stop") {
            self.set_ecm("stopped", "stopped");
        } else if flag("start") && !self.cloud_offline {
            self.set_ecm("connected", "ready");
        }
    }

    fn set_ecm(&mut self, state: &str, sync: &str) {
        if let Some(ecm) = self.tree.pointer_mut("/status/ecm").and_then(Value::as_object_mut) {
            ecm.insert("state".into(), json!(state));
            ecm.insert("sync".into(), json!(sync));
        }
    }

    /// Rebind modems to rules and derive their connection state
    fn refresh(&mut self) {
        let rules: Vec<Value> = self
            .tree
            .pointer("/config/wan/rules2")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let unreachable = &self.unreachable;
        let Some(devices) = self.tree.pointer_mut("/status/wan/devices").and_then(Value::as_object_mut) else {
            return;
        };

        for (uid, device) in devices.iter_mut() {
            if !uid.starts_with(super::paths::MODEM_PREFIX) {
                continue;
            }
            let port = device.pointer("/info/port").and_then(Value::as_str).unwrap_or_default().to_string();
            let sim = device.pointer("/info/sim").and_then(Value::as_str).unwrap_or_default().to_string();
            let no_sim = device
                .pointer("/status/error_text")
                .and_then(Value::as_str)
                .map(|t| t.contains("NOSIM"))
                .unwrap_or(false);

            let bound = best_rule(&rules, &port, &sim);
            let connected = bound
                .map(|rule| !rule_disabled(rule) && !no_sim && !unreachable.contains(uid))
                .unwrap_or(false);

            if let Some(obj) = device.as_object_mut() {
                obj.insert("config".into(), bound.cloned().unwrap_or(Value::Null));
                let status = obj.entry("status").or_insert_with(|| json!({}));
                if let Some(status) = status.as_object_mut() {
                    let state = if connected { "connected" } else { "disconnected" };
                    status.insert("connection_state".into(), json!(state));
                }
            }
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn rule_id(rule: &Value) -> Option<&str> {
    rule.get("_id_").and_then(Value::as_str)
}

fn rule_disabled(rule: &Value) -> bool {
    rule.get("disabled").and_then(Value::as_bool).unwrap_or(false)
}

fn position(items: &[Value], seg: &str) -> Option<usize> {
    match seg.parse::<usize>() {
        Ok(i) if i < items.len() => Some(i),
        Ok(_) => None,
        Err(_) => items.iter().position(|item| rule_id(item) == Some(seg)),
    }
}

fn child<'a>(node: &'a Value, seg: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => position(items, seg).and_then(|i| items.get(i)),
        _ => None,
    }
}

fn navigate<'a>(node: &'a mut Value, segs: &[&str], create: bool) -> Option<&'a mut Value> {
    let mut node = node;
    for seg in segs {
        node = descend(node, seg, create)?;
    }
    Some(node)
}

fn descend<'a>(node: &'a mut Value, seg: &str, create: bool) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => {
            if create {
                Some(
                    map.entry(seg.to_string())
                        .or_insert_with(|| Value::Object(Map::new())),
                )
            } else {
                map.get_mut(seg)
            }
        }
        Value::Array(items) => {
            let index = position(items, seg)?;
            items.get_mut(index)
        }
        _ => None,
    }
}

/// Number of trigger clauses matching the device, `None` on any mismatch
fn trigger_specificity(rule: &Value, port: &str, sim: &str) -> Option<usize> {
    let trigger = rule.get("trigger_string").and_then(Value::as_str).unwrap_or_default();
    let clauses: Vec<&str> = trigger.split('%').filter(|c| !c.is_empty()).collect();
    if clauses.is_empty() {
        return None;
    }
    for clause in &clauses {
        let parts: Vec<&str> = clause.split('|').collect();
        let [key, "is", expected] = parts.as_slice() else {
            return None;
        };
        let actual = match *key {
            "type" => "mdm",
            "port" => port,
            "sim" => sim,
            _ => return None,
        };
        if actual != *expected {
            return None;
        }
    }
    Some(clauses.len())
}

/// Most specific matching rule, then lowest priority, then table order
fn best_rule<'a>(rules: &'a [Value], port: &str, sim: &str) -> Option<&'a Value> {
    let priority = |r: &Value| r.get("priority").and_then(value_to_f64).unwrap_or(f64::MAX);
    rules
        .iter()
        .enumerate()
        .filter_map(|(i, r)| trigger_specificity(r, port, sim).map(|s| (i, r, s)))
        .min_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| priority(a.1).total_cmp(&priority(b.1)))
                .then_with(|| a.0.cmp(&b.0))
        })
        .map(|(_, r, _)| r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_sim() -> InMemoryRouter {
        InMemoryRouter::new()
            .with_rule("generic", 1.0, "type|is|mdm")
            .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "310410")
            .with_modem("mdm-b", "int1", "sim2", "lte", Some(-95.0), "311480")
    }

    #[tokio::test]
    async fn test_rule_addressing_by_index_and_id() {
        let router = dual_sim();
        assert_eq!(router.get("config/wan/rules2/0/_id_").await.unwrap(), Some(json!("generic")));
        assert_eq!(router.get("config/wan/rules2/generic/priority").await.unwrap(), Some(json!(1.0)));
        assert!(router.put("config/wan/rules2/generic/disabled", json!(true)).await.unwrap());
        assert!(!router.put("config/wan/rules2/missing/disabled", json!(true)).await.unwrap());
    }

    #[tokio::test]
    async fn test_devices_follow_specific_rule() {
        let router = dual_sim();
        assert_eq!(router.value("status/wan/devices/mdm-b/config/_id_"), Some(json!("generic")));

        let index = router
            .post(
                "config/wan/rules2/",
                json!({"priority": 1.1, "trigger_string": "type|is|mdm%sim|is|sim2%port|is|int1"}),
            )
            .await
            .unwrap();
        assert_eq!(index, json!(1));

        let new_id = router.value("config/wan/rules2/1/_id_").unwrap();
        assert_eq!(router.value("status/wan/devices/mdm-b/config/_id_"), Some(new_id));
        assert_eq!(router.value("status/wan/devices/mdm-a/config/_id_"), Some(json!("generic")));
    }

    #[tokio::test]
    async fn test_connection_follows_rule_state() {
        let router = dual_sim();
        assert_eq!(router.connected_devices().len(), 2);

        router.put("config/wan/rules2/generic/disabled", json!(true)).await.unwrap();
        assert!(router.connected_devices().is_empty());
        assert_eq!(router.journal().last().unwrap(), &vec![("generic".to_string(), true)]);

        router.put("config/wan/rules2/generic/disabled", json!(false)).await.unwrap();
        router.set_unreachable("mdm-a", true);
        assert_eq!(router.connected_devices(), vec!["mdm-b".to_string()]);
    }

    #[tokio::test]
    async fn test_ecm_control() {
        let router = InMemoryRouter::new();
        router.put("control/ecm", json!({"stop": true})).await.unwrap();
        assert_eq!(router.value("status/ecm/state"), Some(json!("stopped")));
        router.put("control/ecm", json!({"start": "true"})).await.unwrap();
        assert_eq!(router.value("status/ecm/sync"), Some(json!("ready")));
    }

    #[tokio::test]
    async fn test_put_creates_missing_branches() {
        let router = dual_sim();
        assert_eq!(router.get("config/lab/simselector/state").await.unwrap(), None);
        assert!(router.put("config/lab/simselector/state", json!("idle")).await.unwrap());
        assert_eq!(router.get("config/lab/simselector/state").await.unwrap(), Some(json!("idle")));
        assert!(router.put("config/lab/simselector/state", json!("running")).await.unwrap());
        assert_eq!(router.value("config/lab/simselector"), Some(json!({"state": "running"})));
    }

    #[tokio::test]
    async fn test_delete() {
        let router = dual_sim();
        router.set_value("config/wan/rules2/generic/modem", json!({"manual_apn": ""}));
        assert!(router.delete("config/wan/rules2/generic/modem").await.unwrap());
        assert!(router.value("config/wan/rules2/generic/modem").is_none());
        assert!(!router.delete("config/wan/rules2/generic/modem").await.unwrap());
    }
}
