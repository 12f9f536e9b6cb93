//! Ranks eligible destination RSEs for a candidate dataset by free-space
//! ratio and popularity, with a self-cooling penalty so the same RSE
//! isn't picked on every consecutive tick (spec.md §4.7).

use std::collections::HashMap;

use log::info;
use parking_lot::Mutex;

use catalog::did::Did;
use catalog::rse::RseId;
use catalog::Store;

use crate::config::Config;
use crate::error::C3poError;
use crate::popularity::PopularitySource;

/// A single ranked destination, returned when the advisor accepts `did`.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub rse_id: RseId,
    pub score: f64,
}

pub struct Advisor<P: PopularitySource> {
    store: Store,
    config: Config,
    popularity: P,
    penalties: Mutex<HashMap<RseId, f64>>,
}

impl<P: PopularitySource> Advisor<P> {
    pub fn new(store: Store, config: Config, popularity: P) -> Self {
        Advisor { store, config, popularity, penalties: Mutex::new(HashMap::new()) }
    }

    fn penalty_of(&self, rse_id: RseId) -> f64 {
        self.penalties.lock().get(&rse_id).copied().unwrap_or(self.config.penalty_floor)
    }

    /// Decays every tracked penalty by `decay_step`, floored at
    /// `penalty_floor` (spec.md §4.7 "decays by 1 each placement tick").
    pub fn tick(&self) {
        let mut penalties = self.penalties.lock();
        penalties.retain(|_, p| {
            *p = (*p - self.config.decay_step).max(self.config.penalty_floor);
            *p > self.config.penalty_floor
        });
    }

    /// Evaluates `did` as a placement candidate, returning the ranked
    /// winner or `None` if any admission filter declines it.
    pub fn place(&self, did: &Did) -> Result<Option<Decision>, C3poError> {
        if !self.config.name_prefixes.iter().any(|p| did.name.starts_with(p.as_str())) {
            return Ok(None);
        }

        let popularity = self.popularity.popularity(did)?;
        if popularity < self.config.popularity_threshold {
            return Ok(None);
        }

        let tx = self.store.transaction()?;
        let replicas = tx.list_replicas(did)?;

        let mut existing_datadisk = 0usize;
        let mut already_hosting: Vec<RseId> = Vec::new();
        for r in &replicas {
            if is_datadisk(&tx, r.rse_id, &self.config)? {
                existing_datadisk += 1;
                already_hosting.push(r.rse_id);
            }
        }
        if existing_datadisk >= self.config.max_existing_replicas {
            return Ok(None);
        }

        let mut best: Option<Decision> = None;
        for rse in tx.list_rses()? {
            if already_hosting.contains(&rse.id) {
                continue;
            }
            if !is_datadisk(&tx, rse.id, &self.config)? {
                continue;
            }
            let penalty = self.penalty_of(rse.id);
            let score = rse.free_ratio() * 100.0 / penalty;
            if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(Decision { rse_id: rse.id, score });
            }
        }

        if let Some(decision) = &best {
            self.penalties.lock().insert(decision.rse_id, self.config.cooldown_penalty);
            info!("c3po: placed {} on {} (score {:.2})", did, decision.rse_id, decision.score);
        }
        Ok(best)
    }
}

fn is_datadisk(tx: &catalog::Transaction<'_>, rse_id: RseId, config: &Config) -> Result<bool, C3poError> {
    let tier = tx.rse_attribute_value(rse_id, "tier")?;
    let kind = tx.rse_attribute_value(rse_id, "type")?;
    let tier_matches = tier.and_then(|v| v.as_i64()).map(|t| t == config.eligible_tier).unwrap_or(false);
    let type_matches = kind.and_then(|v| v.as_str().map(|s| s == config.eligible_type)).unwrap_or(false);
    Ok(tier_matches && type_matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{Did, DidRecord};
    use catalog::replica::{Replica, ReplicaState};
    use catalog::rse::Rse;
    use uuid::Uuid;

    use crate::popularity::StaticPopularity;

    fn rse(store: &Store, name: &str, used: u64, total: u64, tier: i64, kind: &str) -> RseId {
        let id = RseId(Uuid::new_v4());
        let tx = store.transaction().unwrap();
        tx.add_rse(&Rse {
            id,
            name: name.to_string(),
            deterministic: true,
            volatile: false,
            availability_read: true,
            availability_write: true,
            availability_delete: true,
            usage_used: used,
            usage_total: total,
        })
        .unwrap();
        tx.add_rse_attribute(id, "tier", &serde_json::json!(tier)).unwrap();
        tx.add_rse_attribute(id, "type", &serde_json::json!(kind)).unwrap();
        tx.commit().unwrap();
        id
    }

    #[test]
    fn declines_name_without_prefix() {
        let store = Store::open_in_memory().unwrap();
        let mut pop = StaticPopularity::new();
        let did = Did::new("mc16_13TeV", "other.dataset.1");
        pop.set(did.clone(), 50.0);
        let advisor = Advisor::new(store, Config::default(), pop);
        assert_eq!(advisor.place(&did).unwrap(), None);
    }

    #[test]
    fn declines_below_popularity_threshold() {
        let store = Store::open_in_memory().unwrap();
        let mut pop = StaticPopularity::new();
        let did = Did::new("mc16_13TeV", "data.dataset.1");
        pop.set(did.clone(), 1.0);
        let advisor = Advisor::new(store, Config::default(), pop);
        assert_eq!(advisor.place(&did).unwrap(), None);
    }

    #[test]
    fn picks_highest_free_ratio_among_eligible() {
        let store = Store::open_in_memory().unwrap();
        let did = Did::new("mc16_13TeV", "data.dataset.1");
        {
            let tx = store.transaction().unwrap();
            tx.insert_did(&DidRecord::new_collection(did.clone(), catalog::did::DidKind::Dataset, false)).unwrap();
            tx.commit().unwrap();
        }
        let full = rse(&store, "FULL_DATADISK", 90, 100, 2, "DATADISK");
        let empty = rse(&store, "EMPTY_DATADISK", 10, 100, 2, "DATADISK");
        rse(&store, "TAPE", 10, 100, 1, "TAPE");

        let mut pop = StaticPopularity::new();
        pop.set(did.clone(), 50.0);
        let advisor = Advisor::new(store, Config::default(), pop);

        let decision = advisor.place(&did).unwrap().expect("should place");
        assert_eq!(decision.rse_id, empty);
        assert_ne!(decision.rse_id, full);
    }

    #[test]
    fn declines_when_existing_replicas_at_cap() {
        let store = Store::open_in_memory().unwrap();
        let did = Did::new("mc16_13TeV", "data.dataset.1");
        {
            let tx = store.transaction().unwrap();
            tx.insert_did(&DidRecord::new_collection(did.clone(), catalog::did::DidKind::Dataset, false)).unwrap();
            tx.commit().unwrap();
        }
        for i in 0..5 {
            let id = rse(&store, &format!("DISK{i}"), 10, 100, 2, "DATADISK");
            let tx = store.transaction().unwrap();
            tx.add_replica(&Replica {
                rse_id: id,
                did: did.clone(),
                state: ReplicaState::Available,
                bytes: 1,
                adler32: None,
                md5: None,
                path: None,
                tombstone: None,
                lock_cnt: 0,
            })
            .unwrap();
            tx.commit().unwrap();
        }

        let mut pop = StaticPopularity::new();
        pop.set(did.clone(), 50.0);
        let advisor = Advisor::new(store, Config::default(), pop);
        assert_eq!(advisor.place(&did).unwrap(), None);
    }

    #[test]
    fn cooling_penalty_decays_over_ticks() {
        let store = Store::open_in_memory().unwrap();
        let winner = rse(&store, "DISK_A", 10, 100, 2, "DATADISK");
        let _other = rse(&store, "DISK_B", 50, 100, 2, "DATADISK");

        let pop = StaticPopularity::new();
        let advisor = Advisor::new(store, Config::default(), pop);
        assert_eq!(advisor.penalty_of(winner), 1.0);
        advisor.penalties.lock().insert(winner, 10.0);
        for _ in 0..9 {
            advisor.tick();
        }
        assert_eq!(advisor.penalty_of(winner), 1.0);
    }
}
