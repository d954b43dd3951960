//! WAN rule deduplication
//!
//! Every SIM needs its own WAN rule so it can be enabled on its own. The
//! first SIM seen on a rule keeps it; every other SIM on that rule (or on no
//! rule at all) gets a clone whose trigger matches only its port and slot.
//! Posting a rule makes the router rebind devices, so discovery and the pass
//! are repeated until a pass creates nothing and leaves no SIM sharing a rule.

use crate::config::SelectorConfig;
use crate::discovery::SimDiscovery;
use crate::router::{get_string, paths, value_to_f64, RouterConfigClient};
use crate::sim::SimRecord;
use crate::{Result, SelectorError};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

const SKELETON_PRIORITY: f64 = 1.1;

/// Result of one deduplication pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Rules posted
    pub created: usize,
    /// SIMs still sharing a rule (post failed or clone limit hit)
    pub unresolved: usize,
}

impl PassOutcome {
    /// Nothing created and nothing left over
    pub fn is_settled(&self) -> bool {
        self.created == 0 && self.unresolved == 0
    }
}

/// Guarantees a 1:1 SIM → WAN rule mapping
pub struct WanRuleDeduplicator {
    router: Arc<dyn RouterConfigClient>,
    discovery: Arc<SimDiscovery>,
    max_passes: u32,
    max_clones: u32,
    step: f64,
}

impl WanRuleDeduplicator {
    /// Deduplicator using `discovery` for each pass
    pub fn new(router: Arc<dyn RouterConfigClient>, discovery: Arc<SimDiscovery>, config: &SelectorConfig) -> Self {
        Self {
            router,
            discovery,
            max_passes: config.max_dedup_passes.max(1),
            max_clones: config.max_duplicate_clones.max(1),
            step: config.priority_step,
        }
    }

    /// Discover and deduplicate until a pass creates no rule and every SIM
    /// owns its rule
    pub async fn deduplicate(&self) -> Result<BTreeMap<String, SimRecord>> {
        for pass in 1..=self.max_passes {
            let mut sims = self.discovery.discover().await?;
            let outcome = self.pass(&mut sims).await?;
            if outcome.is_settled() {
                info!(pass, "WAN rules unique");
                return Ok(sims);
            }
            info!(
                pass,
                created = outcome.created,
                unresolved = outcome.unresolved,
                "WAN rules not yet unique, re-running discovery"
            );
        }
        Err(SelectorError::DedupDiverged {
            passes: self.max_passes,
        })
    }

    /// One pass over `sims`.
    ///
    /// A failure on one SIM is logged and that SIM is counted as unresolved
    /// for the next pass.
    pub async fn pass(&self, sims: &mut BTreeMap<String, SimRecord>) -> Result<PassOutcome> {
        let mut owned: HashSet<String> = HashSet::new();
        let mut clones: HashMap<Option<String>, u32> = HashMap::new();
        let mut outcome = PassOutcome::default();

        let uids: Vec<String> = sims.keys().cloned().collect();
        for uid in uids {
            let Some(sim) = sims.get(&uid) else {
                continue;
            };
            if let Some(id) = &sim.rule_id {
                if owned.insert(id.clone()) {
                    continue;
                }
            }

            let nth = clones.entry(sim.rule_id.clone()).or_insert(0);
            *nth += 1;
            if *nth > self.max_clones {
                warn!(
                    "Clone limit reached for rule {:?}, leaving {} for the next pass",
                    sim.rule_id,
                    sim.label()
                );
                outcome.unresolved += 1;
                continue;
            }
            let nth = *nth;

            match self.detach(sim, nth).await {
                Ok(new_id) => {
                    if let Some(sim) = sims.get_mut(&uid) {
                        sim.rule_id = Some(new_id);
                    }
                    outcome.created += 1;
                }
                Err(e) => {
                    warn!("Exception: {} (skipping {} this pass)", e, uid);
                    outcome.unresolved += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Post a clone of `sim`'s rule bound to its port and slot
    async fn detach(&self, sim: &SimRecord, nth: u32) -> Result<String> {
        let body = match &sim.rule_id {
            Some(id) => self.router.get(&paths::rule(id)).await?,
            None => None,
        };
        let mut rule = match body {
            Some(Value::Object(mut body)) => {
                info!("Detaching Duplicate Rules");
                body.remove("_id_");
                body
            }
            _ => skeleton(),
        };

        let base = rule
            .get("priority")
            .and_then(value_to_f64)
            .unwrap_or(SKELETON_PRIORITY);
        rule.insert("priority".into(), json!(round_priority(base + f64::from(nth) * self.step)));
        rule.insert("trigger_name".into(), json!(sim.label()));
        rule.insert("trigger_string".into(), json!(sim.trigger_string()));

        let rule = Value::Object(rule);
        info!("NEW WAN RULE: {}", rule);
        let data = self.router.post(&format!("{}/", paths::WAN_RULES), rule).await?;
        let index = match &data {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => {
                return Err(SelectorError::Router(format!(
                    "rule post returned {} instead of an index",
                    other
                )))
            }
        };
        get_string(self.router.as_ref(), &paths::rule_field(&index, "_id_"))
            .await?
            .ok_or_else(|| SelectorError::Router(format!("new rule at index {} has no id", index)))
    }
}

fn skeleton() -> Map<String, Value> {
    let mut rule = Map::new();
    rule.insert("priority".into(), json!(SKELETON_PRIORITY));
    rule.insert("trigger_name".into(), json!(""));
    rule.insert("trigger_string".into(), json!(""));
    rule
}

/// Keep fractional priorities from accumulating float noise
pub(crate) fn round_priority(p: f64) -> f64 {
    (p * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::{InMemorySink, Notifier};
    use crate::router::InMemoryRouter;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dedup(router: Arc<dyn RouterConfigClient>, config: &SelectorConfig) -> WanRuleDeduplicator {
        let notifier = Arc::new(Notifier::new(
            Arc::new(InMemorySink::new()),
            router.clone(),
            Arc::new(SystemClock),
            "SimSelector",
        ));
        let discovery = Arc::new(SimDiscovery::new(router.clone(), notifier, config));
        WanRuleDeduplicator::new(router, discovery, config)
    }

    fn shared_rule_router() -> Arc<InMemoryRouter> {
        Arc::new(
            InMemoryRouter::new()
                .with_rule("generic", 1.0, "type|is|mdm")
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480")
                .with_modem("mdm-b", "int1", "sim2", "lte", Some(-90.0), "310410")
                .with_modem("mdm-c", "mc400", "sim1", "5G", Some(-100.0), "310410"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_get_cloned_rules() {
        let router = shared_rule_router();
        let sims = dedup(router.clone(), &SelectorConfig::default()).deduplicate().await.unwrap();

        assert_eq!(sims["mdm-a"].rule_id.as_deref(), Some("generic"));
        let ids: HashSet<_> = sims.values().map(|s| s.rule_id.clone().unwrap()).collect();
        assert_eq!(ids.len(), 3);

        let rules = router.rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1]["priority"], json!(1.1));
        assert_eq!(rules[1]["trigger_name"], json!("int1 sim2"));
        assert_eq!(rules[1]["trigger_string"], json!("type|is|mdm%sim|is|sim2%port|is|int1"));
        assert_eq!(rules[2]["priority"], json!(1.2));
        assert_eq!(rules[2]["trigger_string"], json!("type|is|mdm%sim|is|sim1%port|is|mc400"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_sims_get_skeleton() {
        let router = Arc::new(
            InMemoryRouter::new()
                .with_modem("mdm-a", "int1", "sim1", "lte", Some(-80.0), "311480")
                .with_modem("mdm-b", "int1", "sim2", "lte", Some(-90.0), "310410"),
        );
        let sims = dedup(router.clone(), &SelectorConfig::default()).deduplicate().await.unwrap();

        let rules = router.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["priority"], json!(1.2));
        assert_eq!(rules[1]["priority"], json!(1.3));
        assert_eq!(rules[1]["trigger_name"], json!("int1 sim2"));
        assert_ne!(sims["mdm-a"].rule_id, sims["mdm-b"].rule_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_cap_diverges() {
        let router = shared_rule_router();
        let config = SelectorConfig {
            max_duplicate_clones: 1,
            max_dedup_passes: 1,
            ..SelectorConfig::default()
        };
        let err = dedup(router.clone(), &config).deduplicate().await.unwrap_err();
        assert!(matches!(err, SelectorError::DedupDiverged { passes: 1 }));
        // one clone made, the third SIM waits for another pass
        assert_eq!(router.rules().len(), 2);
    }

    /// Rejects rule posts for one slot, `failures` times (forever if `None`)
    struct RejectingRouter {
        inner: Arc<InMemoryRouter>,
        reject: &'static str,
        failures: Option<AtomicU32>,
    }

    impl RejectingRouter {
        fn new(inner: Arc<InMemoryRouter>, reject: &'static str) -> Self {
            Self {
                inner,
                reject,
                failures: None,
            }
        }

        fn times(mut self, n: u32) -> Self {
            self.failures = Some(AtomicU32::new(n));
            self
        }

        fn rejects(&self) -> bool {
            match &self.failures {
                None => true,
                Some(left) => left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok(),
            }
        }
    }

    #[async_trait]
    impl RouterConfigClient for RejectingRouter {
        async fn get(&self, path: &str) -> Result<Option<Value>> {
            self.inner.get(path).await
        }

        async fn put(&self, path: &str, value: Value) -> Result<bool> {
            self.inner.put(path, value).await
        }

        async fn post(&self, path: &str, value: Value) -> Result<Value> {
            if value["trigger_string"].as_str().unwrap_or_default().contains(self.reject) && self.rejects() {
                return Err(SelectorError::Router("rejected".into()));
            }
            self.inner.post(path, value).await
        }

        async fn delete(&self, path: &str) -> Result<bool> {
            self.inner.delete(path).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_sim_failure_skips_only_that_sim() {
        let inner = shared_rule_router();
        let router: Arc<dyn RouterConfigClient> = Arc::new(RejectingRouter::new(inner.clone(), "port|is|mc400"));
        let dedup = dedup(router, &SelectorConfig::default());

        let mut sims = dedup.discovery.discover().await.unwrap();
        let outcome = dedup.pass(&mut sims).await.unwrap();
        assert_eq!(outcome, PassOutcome { created: 1, unresolved: 1 });
        assert!(!outcome.is_settled());
        assert_eq!(sims["mdm-c"].rule_id.as_deref(), Some("generic"));
        assert_eq!(inner.rules().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_clone_never_reported_unique() {
        let inner = shared_rule_router();
        let router: Arc<dyn RouterConfigClient> = Arc::new(RejectingRouter::new(inner.clone(), "port|is|mc400"));
        let config = SelectorConfig {
            max_dedup_passes: 3,
            ..SelectorConfig::default()
        };

        let err = dedup(router, &config).deduplicate().await.unwrap_err();
        assert!(matches!(err, SelectorError::DedupDiverged { passes: 3 }));
        assert_eq!(inner.rules().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_by_next_pass() {
        let inner = shared_rule_router();
        let router: Arc<dyn RouterConfigClient> =
            Arc::new(RejectingRouter::new(inner.clone(), "port|is|mc400").times(1));

        let sims = dedup(router, &SelectorConfig::default()).deduplicate().await.unwrap();

        let ids: HashSet<_> = sims.values().filter_map(|s| s.rule_id.clone()).collect();
        assert_eq!(ids.len(), sims.len());
        assert_ne!(sims["mdm-c"].rule_id.as_deref(), Some("generic"));
        assert_eq!(inner.rules().len(), 3);
    }

    const SLOTS: [(&str, &str); 6] = [
        ("int1", "sim1"),
        ("int1", "sim2"),
        ("mc400", "sim1"),
        ("mc400", "sim2"),
        ("mc400-2", "sim1"),
        ("mc400-2", "sim2"),
    ];

    const TRIGGERS: [&str; 4] = [
        "type|is|mdm",
        "type|is|mdm%port|is|int1",
        "type|is|mdm%sim|is|sim1",
        "type|is|mdm%port|is|mc400",
    ];

    fn build(slots: &[usize], triggers: &[(usize, u8)]) -> Arc<InMemoryRouter> {
        let mut router = InMemoryRouter::new();
        for (i, (t, p)) in triggers.iter().enumerate() {
            router = router.with_rule(&format!("rule-{}", i), 1.0 + f64::from(*p) / 10.0, TRIGGERS[*t]);
        }
        for (i, s) in slots.iter().enumerate() {
            let (port, sim) = SLOTS[*s];
            router = router.with_modem(&format!("mdm-{}", i), port, sim, "lte", Some(-85.0), "311480");
        }
        Arc::new(router)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_dedup_unique_and_idempotent(
            slots in proptest::sample::subsequence((0..SLOTS.len()).collect::<Vec<_>>(), 2..=SLOTS.len()),
            triggers in proptest::collection::vec((0..TRIGGERS.len(), 0u8..5), 0..4),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let router = build(&slots, &triggers);
                let dedup = dedup(router.clone(), &SelectorConfig::default());

                let first = dedup.deduplicate().await.unwrap();
                let ids: HashSet<_> = first.values().filter_map(|s| s.rule_id.clone()).collect();
                prop_assert_eq!(ids.len(), first.len());

                let rules_before = router.rules();
                let second = dedup.deduplicate().await.unwrap();
                prop_assert_eq!(router.rules(), rules_before);
                for (uid, sim) in &second {
                    prop_assert_eq!(&sim.rule_id, &first[uid].rule_id);
                }
                Ok(())
            })?;
        }
    }
}
