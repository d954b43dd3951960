//! SIM ranking
//!
//! Pure function over measured records. SIMs that meet their technology
//! floor sort by (download, upload, RSRP); SIMs below it sort by
//! (upload, download, RSRP). A tie band then reorders SIMs whose speeds are
//! practically equal so the better signal wins.

use crate::sim::SimRecord;
use std::cmp::Ordering;

/// Ranked order plus whether any SIM met minimums
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    /// Device uids, best first
    pub order: Vec<String>,
    /// At least one connected SIM met its minimum speeds
    pub met_minimums: bool,
}

/// Multi-criteria SIM ranker
#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    tie_band: f64,
}

#[derive(Debug, Clone)]
struct Entry {
    uid: String,
    download: f64,
    upload: f64,
    rsrp: f64,
    below_minimum: bool,
}

impl Entry {
    fn key(&self) -> [f64; 3] {
        if self.below_minimum {
            [self.upload, self.download, self.rsrp]
        } else {
            [self.download, self.upload, self.rsrp]
        }
    }
}

impl Ranker {
    /// Ranker with a relative tie band (0.10 = 10%)
    pub fn new(tie_band: f64) -> Self {
        Self { tie_band }
    }

    /// Rank records, best first. Input order only breaks exact ties.
    pub fn rank<'a, I>(&self, sims: I) -> Ranking
    where
        I: IntoIterator<Item = &'a SimRecord>,
    {
        let mut met_minimums = false;
        let mut entries: Vec<Entry> = sims
            .into_iter()
            .map(|sim| {
                met_minimums |= sim.connected && sim.is_measured() && !sim.below_minimum;
                Entry {
                    uid: sim.uid.clone(),
                    download: sim.download_mbps.unwrap_or(0.0),
                    upload: sim.upload_mbps.unwrap_or(0.0),
                    rsrp: sim.rsrp().unwrap_or(f64::NEG_INFINITY),
                    below_minimum: sim.below_minimum,
                }
            })
            .collect();

        entries.sort_by(|a, b| descending(&a.key(), &b.key()));
        let entries = self.apply_tie_bands(entries);

        Ranking {
            order: entries.into_iter().map(|e| e.uid).collect(),
            met_minimums,
        }
    }

    fn apply_tie_bands(&self, sorted: Vec<Entry>) -> Vec<Entry> {
        if sorted.len() < 2 {
            return sorted;
        }

        let top_download = sorted[0].download;
        let (mut similar, rest): (Vec<Entry>, Vec<Entry>) = sorted
            .into_iter()
            .partition(|e| self.within(e.download, top_download));
        if similar.len() < 2 {
            return similar.into_iter().chain(rest).collect();
        }

        let max_upload = similar.iter().map(|e| e.upload).fold(f64::NEG_INFINITY, f64::max);
        let upload_ties = similar
            .iter()
            .filter(|e| self.within(e.upload, max_upload))
            .count();

        if upload_ties > 1 {
            let (mut front, others): (Vec<Entry>, Vec<Entry>) = similar
                .into_iter()
                .partition(|e| self.within(e.upload, max_upload));
            front.sort_by(|a, b| b.rsrp.total_cmp(&a.rsrp));
            front.into_iter().chain(others).chain(rest).collect()
        } else {
            similar.sort_by(|a, b| b.upload.total_cmp(&a.upload));
            similar.into_iter().chain(rest).collect()
        }
    }

    /// `value` within the tie band of `reference`; a zero reference ties everything
    fn within(&self, value: f64, reference: f64) -> bool {
        if reference == 0.0 {
            return true;
        }
        (reference - value).abs() / reference.abs() <= self.tie_band
    }
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new(0.10)
    }
}

fn descending(a: &[f64; 3], b: &[f64; 3]) -> Ordering {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| y.total_cmp(x))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Diagnostics, SignalQuality, Technology};
    use proptest::prelude::*;

    fn sim(uid: &str, down: f64, up: f64, rsrp: Option<f64>, below: bool) -> SimRecord {
        SimRecord {
            uid: uid.into(),
            port: "int1".into(),
            sim_slot: "sim1".into(),
            rule_id: Some(format!("rule-{}", uid)),
            priority: 1.0,
            technology: Technology::Lte,
            diagnostics: Some(Diagnostics { rsrp, ..Default::default() }),
            signal_quality: SignalQuality::from_rsrp(rsrp),
            download_mbps: Some(down),
            upload_mbps: Some(up),
            below_minimum: below,
            connected: true,
            failure: None,
        }
    }

    #[test]
    fn test_rsrp_breaks_speed_tie() {
        let sims = vec![
            sim("A", 50.0, 15.0, Some(-75.0), false),
            sim("B", 52.0, 16.0, Some(-80.0), false),
        ];
        let ranking = Ranker::default().rank(&sims);
        assert_eq!(ranking.order, vec!["A", "B"]);
        assert!(ranking.met_minimums);
    }

    #[test]
    fn test_below_minimum_ranks_upload_first() {
        let sims = vec![
            sim("Y", 9.0, 1.0, Some(-80.0), true),
            sim("X", 8.0, 3.0, Some(-90.0), true),
        ];
        let ranking = Ranker::default().rank(&sims);
        assert_eq!(ranking.order, vec!["X", "Y"]);
        assert!(!ranking.met_minimums);
    }

    #[test]
    fn test_clear_download_winner() {
        let sims = vec![
            sim("slow", 20.0, 5.0, Some(-70.0), false),
            sim("fast", 80.0, 4.0, Some(-100.0), false),
        ];
        assert_eq!(Ranker::default().rank(&sims).order, vec!["fast", "slow"]);
    }

    #[test]
    fn test_download_tie_resolved_by_upload() {
        let sims = vec![
            sim("a", 100.0, 5.0, Some(-70.0), false),
            sim("b", 95.0, 20.0, Some(-100.0), false),
            sim("c", 40.0, 30.0, Some(-60.0), false),
        ];
        assert_eq!(Ranker::default().rank(&sims).order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_all_zero_ties_on_signal() {
        let sims = vec![
            sim("a", 0.0, 0.0, None, true),
            sim("b", 0.0, 0.0, Some(-110.0), true),
            sim("c", 0.0, 0.0, Some(-85.0), true),
        ];
        assert_eq!(Ranker::default().rank(&sims).order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_failed_sims_do_not_meet_minimums() {
        let mut failed = sim("a", 0.0, 0.0, None, true);
        failed.mark_failed("timeout");
        let ranking = Ranker::default().rank(std::iter::once(&failed));
        assert_eq!(ranking.order, vec!["a"]);
        assert!(!ranking.met_minimums);
    }

    fn arb_sim() -> impl Strategy<Value = (f64, f64, Option<f64>, bool)> {
        (
            0.0f64..200.0,
            0.0f64..50.0,
            proptest::option::of(-130.0f64..-50.0),
            any::<bool>(),
        )
    }

    proptest! {
        #[test]
        fn prop_rank_is_deterministic_permutation(specs in proptest::collection::vec(arb_sim(), 0..8)) {
            let sims: Vec<SimRecord> = specs
                .iter()
                .enumerate()
                .map(|(i, (d, u, r, b))| sim(&format!("mdm-{}", i), *d, *u, *r, *b))
                .collect();
            let ranker = Ranker::default();

            let first = ranker.rank(&sims);
            let second = ranker.rank(&sims);
            prop_assert_eq!(&first, &second);

            let mut order = first.order.clone();
            order.sort();
            let mut uids: Vec<String> = sims.iter().map(|s| s.uid.clone()).collect();
            uids.sort();
            prop_assert_eq!(order, uids);
        }
    }
}
