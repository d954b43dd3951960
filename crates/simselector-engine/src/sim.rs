//! SIM records
//!
//! Typed view of a modem entry under `status/wan/devices/<uid>`, mapped
//! field-by-field from the raw tree and validated at the boundary.

use crate::router::{value_to_f64, value_to_string};
use crate::{Result, SelectorError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Radio technology class; selects the minimum-speed floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technology {
    /// 5G NR
    FiveG,
    /// LTE
    Lte,
    /// Anything else (3G, unknown)
    Other,
}

impl Technology {
    /// Classify a platform technology label ("5G", "lte", "LTE-A", ...)
    pub fn from_label(label: &str) -> Self {
        let upper = label.to_ascii_uppercase();
        if upper.contains("5G") {
            Technology::FiveG
        } else if upper.contains("LTE") {
            Technology::Lte
        } else {
            Technology::Other
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::FiveG => write!(f, "5G"),
            Technology::Lte => write!(f, "LTE"),
            Technology::Other => write!(f, "other"),
        }
    }
}

/// Signal classification derived from RSRP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalQuality {
    /// RSRP above -90 dBm
    Good,
    /// -105 ..= -90 dBm
    Weak,
    /// Below -105 dBm
    Bad,
    /// No reading
    Unknown,
}

impl SignalQuality {
    /// Classify an RSRP reading in dBm
    pub fn from_rsrp(rsrp: Option<f64>) -> Self {
        match rsrp {
            None => SignalQuality::Unknown,
            Some(r) if r > -90.0 => SignalQuality::Good,
            Some(r) if r >= -105.0 => SignalQuality::Weak,
            Some(_) => SignalQuality::Bad,
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalQuality::Good => "Good",
            SignalQuality::Weak => "Weak",
            SignalQuality::Bad => "Bad",
            SignalQuality::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Signal and carrier snapshot captured while a SIM is connected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// RSRP in dBm
    pub rsrp: Option<f64>,
    /// Home carrier id (HOMECARRID)
    pub home_carrier_id: Option<String>,
    /// RF band (RFBAND)
    pub rf_band: Option<String>,
    /// Provider name (PRD)
    pub provider: Option<String>,
    /// Serving carrier name (CARRID)
    pub carrier: Option<String>,
}

impl Diagnostics {
    /// Map the raw diagnostics node; unknown or malformed fields become `None`
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(value_to_string).filter(|s| !s.is_empty());
        Self {
            rsrp: value.get("RSRP").and_then(value_to_f64),
            home_carrier_id: text("HOMECARRID"),
            rf_band: text("RFBAND"),
            provider: text("PRD"),
            carrier: text("CARRID"),
        }
    }
}

/// One physically detected SIM-bearing WAN device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimRecord {
    /// Platform device id (`mdm-...`)
    pub uid: String,
    /// Physical port label
    pub port: String,
    /// SIM slot label
    pub sim_slot: String,
    /// Bound WAN rule; `None` until deduplication completes
    pub rule_id: Option<String>,
    /// Priority of the bound rule
    pub priority: f64,
    /// Radio technology reported by the modem
    pub technology: Technology,
    /// Last diagnostics snapshot
    pub diagnostics: Option<Diagnostics>,
    /// RSRP band
    pub signal_quality: SignalQuality,
    /// Measured download, Mbps
    pub download_mbps: Option<f64>,
    /// Measured upload, Mbps
    pub upload_mbps: Option<f64>,
    /// Measured speeds under the technology floor
    pub below_minimum: bool,
    /// Reached `connected` during its test window
    pub connected: bool,
    /// Why the last measurement failed
    pub failure: Option<String>,
}

impl SimRecord {
    /// Build from a raw device node
    pub fn from_device(uid: &str, device: &Value) -> Result<Self> {
        let info = device
            .get("info")
            .ok_or_else(|| SelectorError::InvalidRecord(format!("{}: missing info", uid)))?;
        let port = info
            .get("port")
            .and_then(value_to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SelectorError::InvalidRecord(format!("{}: missing port", uid)))?;
        let sim_slot = info
            .get("sim")
            .and_then(value_to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SelectorError::InvalidRecord(format!("{}: missing sim", uid)))?;

        let tech_label = info
            .get("tech")
            .and_then(Value::as_str)
            .or_else(|| device.pointer("/diagnostics/SRVC_TYPE").and_then(Value::as_str))
            .unwrap_or_default();

        let config = device.get("config");
        let rule_id = config
            .and_then(|c| c.get("_id_"))
            .and_then(value_to_string);
        let priority = config
            .and_then(|c| c.get("priority"))
            .and_then(value_to_f64)
            .unwrap_or(0.0);

        Ok(Self {
            uid: uid.to_string(),
            port,
            sim_slot,
            rule_id,
            priority,
            technology: Technology::from_label(tech_label),
            diagnostics: None,
            signal_quality: SignalQuality::Unknown,
            download_mbps: None,
            upload_mbps: None,
            below_minimum: false,
            connected: false,
            failure: None,
        })
    }

    /// "<port> <sim>" label used in messages and rule names
    pub fn label(&self) -> String {
        format!("{} {}", self.port, self.sim_slot)
    }

    /// Trigger string binding a rule to exactly this port and slot
    pub fn trigger_string(&self) -> String {
        format!("type|is|mdm%sim|is|{}%port|is|{}", self.sim_slot, self.port)
    }

    /// RSRP from the last diagnostics snapshot
    pub fn rsrp(&self) -> Option<f64> {
        self.diagnostics.as_ref().and_then(|d| d.rsrp)
    }

    /// Speeds have been recorded (possibly zero)
    pub fn is_measured(&self) -> bool {
        self.download_mbps.is_some() && self.upload_mbps.is_some()
    }

    /// Whether the device reports a missing SIM
    pub fn device_has_no_sim(device: &Value) -> bool {
        device
            .pointer("/status/error_text")
            .and_then(Value::as_str)
            .map(|t| t.contains("NOSIM"))
            .unwrap_or(false)
    }

    /// Record a measurement failure: zero speeds, disconnected
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.connected = false;
        self.download_mbps = Some(0.0);
        self.upload_mbps = Some(0.0);
        self.failure = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_classification_boundaries() {
        assert_eq!(SignalQuality::from_rsrp(Some(-89.0)), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rsrp(Some(-90.0)), SignalQuality::Weak);
        assert_eq!(SignalQuality::from_rsrp(Some(-105.0)), SignalQuality::Weak);
        assert_eq!(SignalQuality::from_rsrp(Some(-106.0)), SignalQuality::Bad);
        assert_eq!(SignalQuality::from_rsrp(None), SignalQuality::Unknown);
    }

    #[test]
    fn test_record_from_device() {
        let device = json!({
            "info": {"port": "int1", "sim": "sim2", "tech": "5G"},
            "config": {"_id_": "00000000-abcd", "priority": "1.2"},
            "status": {"error_text": ""},
        });
        let sim = SimRecord::from_device("mdm-2", &device).unwrap();
        assert_eq!(sim.label(), "int1 sim2");
        assert_eq!(sim.rule_id.as_deref(), Some("00000000-abcd"));
        assert_eq!(sim.priority, 1.2);
        assert_eq!(sim.technology, Technology::FiveG);
        assert_eq!(sim.trigger_string(), "type|is|mdm%sim|is|sim2%port|is|int1");
        assert!(!sim.is_measured());
    }

    #[test]
    fn test_record_rejects_missing_port() {
        let device = json!({"info": {"sim": "sim1"}});
        let err = SimRecord::from_device("mdm-1", &device).unwrap_err();
        assert!(matches!(err, SelectorError::InvalidRecord(_)));
    }

    #[test]
    fn test_diagnostics_lenient() {
        let diag = Diagnostics::from_value(&json!({
            "RSRP": "-97", "HOMECARRID": 311480, "RFBAND": "Band 13", "PRD": "", "CARRID": "Verizon"
        }));
        assert_eq!(diag.rsrp, Some(-97.0));
        assert_eq!(diag.home_carrier_id.as_deref(), Some("311480"));
        assert_eq!(diag.provider, None);
        assert_eq!(diag.carrier.as_deref(), Some("Verizon"));
    }
}
