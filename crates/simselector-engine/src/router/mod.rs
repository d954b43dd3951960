//! Router config tree access
//!
//! The router exposes one hierarchical namespace (`status/...`,
//! `config/...`, `control/...`). Everything the engine knows about SIMs,
//! WAN rules and the management channel is re-read from here on every
//! step rather than cached.

mod memory;

pub use memory::{InMemoryRouter, RuleSnapshot};

use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Config/status tree client provided by the host router
#[async_trait]
pub trait RouterConfigClient: Send + Sync {
    /// Read a node; `None` when the path does not exist
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replace a node
    async fn put(&self, path: &str, value: Value) -> Result<bool>;

    /// Append to a list node, returning the router's `data` (new index)
    async fn post(&self, path: &str, value: Value) -> Result<Value>;

    /// Remove a node
    async fn delete(&self, path: &str) -> Result<bool>;
}

/// Read and deserialize a node
pub async fn get_as<T: DeserializeOwned>(
    router: &dyn RouterConfigClient,
    path: &str,
) -> Result<Option<T>> {
    match router.get(path).await? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Read a scalar as text (numbers are stringified)
pub async fn get_string(router: &dyn RouterConfigClient, path: &str) -> Result<Option<String>> {
    Ok(router.get(path).await?.as_ref().and_then(value_to_string))
}

/// Read a scalar as a number (numeric strings are parsed)
pub async fn get_f64(router: &dyn RouterConfigClient, path: &str) -> Result<Option<f64>> {
    Ok(router.get(path).await?.as_ref().and_then(value_to_f64))
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Well-known paths
#[allow(missing_docs)]
pub mod paths {
    pub const WAN_DEVICES: &str = "status/wan/devices";
    pub const WAN_CONNECTION_STATE: &str = "status/wan/connection_state";
    pub const PRIMARY_DEVICE: &str = "status/wan/primary_device";
    pub const WAN_RULES: &str = "config/wan/rules2";
    pub const DUAL_SIM_MASK: &str = "config/wan/dual_sim_disable_mask";
    pub const REMOTE_DUAL_SIM_MASK: &str = "config/wan/rem_dual_sim_disable_mask";
    pub const CUSTOM_APNS: &str = "config/wan/custom_apns";
    pub const ECM_CONTROL: &str = "control/ecm";
    pub const ECM_STATE: &str = "status/ecm/state";
    pub const ECM_SYNC: &str = "status/ecm/sync";
    pub const ECM_CLIENT_ID: &str = "status/ecm/client_id";
    pub const SYSTEM_UPTIME: &str = "status/system/uptime";
    pub const PRODUCT_NAME: &str = "status/product_info/product_name";
    pub const SYSTEM_ID: &str = "config/system/system_id";
    pub const DESCRIPTION: &str = "config/system/desc";
    pub const ASSET_ID: &str = "config/system/asset_id";
    pub const ALERT: &str = "control/system/sdk/alert";

    /// Modem devices are the only SIM-bearing WAN devices
    pub const MODEM_PREFIX: &str = "mdm-";

    pub fn device(uid: &str) -> String {
        format!("{}/{}", WAN_DEVICES, uid)
    }

    pub fn device_connection_state(uid: &str) -> String {
        format!("{}/{}/status/connection_state", WAN_DEVICES, uid)
    }

    pub fn device_diagnostics(uid: &str) -> String {
        format!("{}/{}/diagnostics", WAN_DEVICES, uid)
    }

    pub fn device_rule_id(uid: &str) -> String {
        format!("{}/{}/config/_id_", WAN_DEVICES, uid)
    }

    pub fn device_priority(uid: &str) -> String {
        format!("{}/{}/config/priority", WAN_DEVICES, uid)
    }

    pub fn rule(id: &str) -> String {
        format!("{}/{}", WAN_RULES, id)
    }

    pub fn rule_field(id: &str, field: &str) -> String {
        format!("{}/{}/{}", WAN_RULES, id, field)
    }
}
