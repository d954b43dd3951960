//! Human-readable result text for the description field and alerts

use crate::config::MinimumSpeeds;
use crate::notify::truncate_to_bytes;
use crate::ranker::Ranking;
use crate::sim::SimRecord;
use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap};

const TIMESTAMP: &str = "%m/%d/%y %H:%M:%S";

/// "<PRD> <HOMECARRID> <RFBAND> RSRP:<rsrp> DL:<x>Mbps UL:<y>Mbps"
pub fn sim_summary(sim: &SimRecord) -> String {
    let diag = sim.diagnostics.clone().unwrap_or_default();
    let field = |v: Option<String>| v.unwrap_or_else(|| "None".into());
    format!(
        "{} {} {} RSRP:{} DL:{:.2}Mbps UL:{:.2}Mbps",
        field(diag.provider),
        field(diag.home_carrier_id),
        field(diag.rf_band),
        field(diag.rsrp.map(|r| r.to_string())),
        sim.download_mbps.unwrap_or(0.0),
        sim.upload_mbps.unwrap_or(0.0),
    )
}

/// Final ranking line: timestamp, optional minimums marker, then one
/// pipe-delimited summary per SIM in ranked order
pub fn final_report(
    now: DateTime<Local>,
    sims: &BTreeMap<String, SimRecord>,
    ranking: &Ranking,
    minimums: &MinimumSpeeds,
    limit: usize,
) -> String {
    let mut text = now.format(TIMESTAMP).to_string();
    if !ranking.met_minimums {
        text.push_str(&format!(" FAILED TO MEET MINIMUMS! {}", minimums));
    }
    for sim in ranking.order.iter().filter_map(|uid| sims.get(uid)) {
        text.push_str(" | ");
        text.push_str(&sim_summary(sim));
    }
    truncate_to_bytes(&text, limit).to_string()
}

/// Per-port signal digest emitted at the end of validation
pub fn validation_digest(now: DateTime<Local>, sims: &BTreeMap<String, SimRecord>, limit: usize) -> String {
    let mut ports: Vec<&str> = Vec::new();
    let mut by_port: HashMap<&str, Vec<String>> = HashMap::new();
    for sim in sims.values() {
        let status = if sim.connected {
            match sim.rsrp() {
                Some(rsrp) => format!("{} {} {}dBm", sim.sim_slot, sim.signal_quality, rsrp),
                None => format!("{} {}", sim.sim_slot, sim.signal_quality),
            }
        } else {
            format!("{} No Connection", sim.sim_slot)
        };
        if !by_port.contains_key(sim.port.as_str()) {
            ports.push(&sim.port);
        }
        by_port.entry(&sim.port).or_default().push(status);
    }

    let mut text = format!("Staging {}:", now.format(TIMESTAMP));
    for (i, port) in ports.iter().enumerate() {
        let slots = by_port.get(port).map(|s| s.join(", ")).unwrap_or_default();
        text.push_str(if i == 0 { " " } else { " | " });
        text.push_str(&format!("{} [{}]", port, slots));
    }
    truncate_to_bytes(&text, limit).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Diagnostics, SignalQuality, Technology};
    use chrono::TimeZone;

    fn sim(uid: &str, port: &str, slot: &str, rsrp: Option<f64>, connected: bool) -> SimRecord {
        SimRecord {
            uid: uid.into(),
            port: port.into(),
            sim_slot: slot.into(),
            rule_id: None,
            priority: 1.0,
            technology: Technology::Lte,
            diagnostics: Some(Diagnostics {
                rsrp,
                home_carrier_id: Some("311480".into()),
                rf_band: Some("Band 13".into()),
                provider: Some("Verizon".into()),
                carrier: None,
            }),
            signal_quality: SignalQuality::from_rsrp(rsrp),
            download_mbps: Some(52.346),
            upload_mbps: Some(16.0),
            below_minimum: false,
            connected,
            failure: None,
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()
    }

    #[test]
    fn test_final_report_format() {
        let sims: BTreeMap<_, _> = [
            ("mdm-a".to_string(), sim("mdm-a", "int1", "sim1", Some(-75.0), true)),
            ("mdm-b".to_string(), sim("mdm-b", "int1", "sim2", None, true)),
        ]
        .into_iter()
        .collect();
        let ranking = Ranking {
            order: vec!["mdm-b".into(), "mdm-a".into()],
            met_minimums: false,
        };

        let text = final_report(now(), &sims, &ranking, &MinimumSpeeds::default(), 1023);
        assert_eq!(
            text,
            "03/07/24 14:05:09 FAILED TO MEET MINIMUMS! MIN_DOWNLOAD_SPD:{5G:30, LTE:10} MIN_UPLOAD_SPD:{5G:2, LTE:1} \
             | Verizon 311480 Band 13 RSRP:None DL:52.35Mbps UL:16.00Mbps \
             | Verizon 311480 Band 13 RSRP:-75 DL:52.35Mbps UL:16.00Mbps"
        );
    }

    #[test]
    fn test_final_report_truncated() {
        let sims: BTreeMap<_, _> = (0..40)
            .map(|i| {
                let uid = format!("mdm-{:02}", i);
                let record = sim(&uid, "int1", "sim1", Some(-80.0), true);
                (uid, record)
            })
            .collect();
        let ranking = Ranking {
            order: sims.keys().cloned().collect(),
            met_minimums: true,
        };
        let text = final_report(now(), &sims, &ranking, &MinimumSpeeds::default(), 1023);
        assert_eq!(text.len(), 1023);
        assert!(!text.contains("FAILED"));
    }

    #[test]
    fn test_validation_digest_groups_by_port() {
        let sims: BTreeMap<_, _> = [
            ("mdm-a".to_string(), sim("mdm-a", "int1", "sim1", Some(-85.0), true)),
            ("mdm-b".to_string(), sim("mdm-b", "int1", "sim2", Some(-97.0), true)),
            ("mdm-c".to_string(), sim("mdm-c", "mc400", "sim1", None, false)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            validation_digest(now(), &sims, 1023),
            "Staging 03/07/24 14:05:09: int1 [sim1 Good -85dBm, sim2 Weak -97dBm] | mc400 [sim1 No Connection]"
        );
    }
}
