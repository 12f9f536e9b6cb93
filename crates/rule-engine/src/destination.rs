//! Destination selection: within a grouping equivalence class, picks the
//! `copies` RSEs a file or dataset's locks should land on (spec.md §4.4
//! "Destination selection").

use std::collections::HashSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;

use catalog::replica::ReplicaState;
use catalog::rse::RseId;
use catalog::Transaction;

use crate::error::RuleEngineError;

/// Picks `needed` RSEs from `candidates`, excluding `exclude` (RSEs that
/// already hold a lock for this rule on this file/dataset), clamped to
/// however many eligible RSEs actually exist — requesting more replicas
/// than there are write-available RSEs is not a hard error (see
/// DESIGN.md); the engine grounds as many as it can and re-evaluation
/// picks up the rest once more RSEs become eligible.
pub fn select_destinations(
    tx: &Transaction<'_>,
    candidates: &HashSet<RseId>,
    exclude: &HashSet<RseId>,
    needed: usize,
    weight_attr: Option<&str>,
    did: &catalog::did::Did,
) -> Result<Vec<RseId>, RuleEngineError> {
    let mut eligible: Vec<RseId> = Vec::new();
    for &rse_id in candidates {
        if exclude.contains(&rse_id) {
            continue;
        }
        let rse = tx.get_rse(rse_id)?;
        if rse.availability_write {
            eligible.push(rse_id);
        }
    }
    if eligible.is_empty() || needed == 0 {
        return Ok(Vec::new());
    }

    if let Some(attr) = weight_attr {
        select_weighted(tx, eligible, needed, attr)
    } else {
        select_preferred(tx, eligible, needed, did)
    }
}

/// Weighted sampling without replacement: each draw builds a fresh
/// `WeightedIndex` over the remaining pool, so earlier draws never bias
/// later ones beyond removing the chosen candidate. Zero-weight RSEs
/// only appear once every positive-weight RSE has been exhausted,
/// because a pool that is all-zero falls back to picking by id instead
/// of sampling (spec.md §4.4 "weight 0 candidates are chosen only if the
/// higher-weighted candidates are insufficient").
fn select_weighted(tx: &Transaction<'_>, mut pool: Vec<RseId>, needed: usize, attr: &str) -> Result<Vec<RseId>, RuleEngineError> {
    pool.sort_by_key(|id| id.0);
    let mut chosen = Vec::new();
    let mut rng = thread_rng();

    while chosen.len() < needed && !pool.is_empty() {
        let weights: Vec<u64> = pool
            .iter()
            .map(|&id| attribute_weight(tx, id, attr).unwrap_or(0))
            .collect();
        let total: u64 = weights.iter().sum();
        let pick_index = if total == 0 {
            // All remaining candidates are weight-0 (or unparseable):
            // fall back to the lowest id, deterministic tiebreak.
            0
        } else {
            let dist = WeightedIndex::new(&weights).expect("at least one positive weight when total > 0");
            dist.sample(&mut rng)
        };
        chosen.push(pool.remove(pick_index));
    }
    Ok(chosen)
}

/// Parses an RSE's weight attribute as a non-negative integer. A missing,
/// negative, or non-numeric value is treated as weight 0 rather than
/// rejected outright (spec.md §9 Open Question: "the specification
/// assumes non-negative integers" for well-formed input; malformed
/// values are excluded from preferential sampling rather than erroring
/// the whole rule).
fn attribute_weight(tx: &Transaction<'_>, rse_id: RseId, attr: &str) -> Option<u64> {
    let value = tx.rse_attribute_value(rse_id, attr).ok().flatten()?;
    match value {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_i64().filter(|v| *v >= 0).map(|v| v as u64)),
        serde_json::Value::String(s) => s.parse::<i64>().ok().filter(|v| *v >= 0).map(|v| v as u64),
        _ => None,
    }
}

/// Unweighted preference order: RSEs already holding an `AVAILABLE`
/// replica of `did` first (zero-copy satisfaction), then by free-space
/// ratio descending, ties broken by RSE id (spec.md §4.4 step 3).
fn select_preferred(tx: &Transaction<'_>, pool: Vec<RseId>, needed: usize, did: &catalog::did::Did) -> Result<Vec<RseId>, RuleEngineError> {
    let available: HashSet<RseId> = tx
        .list_replicas(did)?
        .into_iter()
        .filter(|r| r.state == ReplicaState::Available)
        .map(|r| r.rse_id)
        .collect();

    let mut scored: Vec<(bool, f64, RseId)> = Vec::new();
    for rse_id in pool {
        let rse = tx.get_rse(rse_id)?;
        scored.push((available.contains(&rse_id), rse.free_ratio(), rse_id));
    }
    // zero-copy first (true > false), then free ratio descending, then id ascending.
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.2 .0.cmp(&b.2 .0))
    });
    Ok(scored.into_iter().take(needed).map(|(_, _, id)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{Did, DidKind, DidRecord};
    use catalog::rse::Rse;
    use catalog::Store;
    use uuid::Uuid;

    fn rse(tx: &Transaction<'_>, name: &str, usage_used: u64, usage_total: u64) -> RseId {
        let id = RseId(Uuid::new_v4());
        tx.add_rse(&Rse {
            id,
            name: name.to_string(),
            deterministic: true,
            volatile: false,
            availability_read: true,
            availability_write: true,
            availability_delete: true,
            usage_used,
            usage_total,
        })
        .unwrap();
        id
    }

    #[test]
    fn prefers_rse_with_existing_available_replica() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let r1 = rse(&tx, "R1", 90, 100);
        let r2 = rse(&tx, "R2", 10, 100);
        tx.add_replica(&catalog::replica::Replica {
            rse_id: r2,
            did: file.clone(),
            state: ReplicaState::Available,
            bytes: 10,
            adler32: None,
            md5: None,
            path: None,
            tombstone: None,
            lock_cnt: 0,
        })
        .unwrap();

        let candidates: HashSet<RseId> = [r1, r2].into_iter().collect();
        let chosen = select_destinations(&tx, &candidates, &HashSet::new(), 1, None, &file).unwrap();
        assert_eq!(chosen, vec![r2], "R2 already has an AVAILABLE replica despite less free space");
    }

    #[test]
    fn falls_back_to_free_space_ratio() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let r1 = rse(&tx, "R1", 90, 100);
        let r2 = rse(&tx, "R2", 10, 100);

        let candidates: HashSet<RseId> = [r1, r2].into_iter().collect();
        let chosen = select_destinations(&tx, &candidates, &HashSet::new(), 1, None, &file).unwrap();
        assert_eq!(chosen, vec![r2]);
    }

    #[test]
    fn weighted_sampling_excludes_zero_weight_until_exhausted() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let heavy = rse(&tx, "HEAVY", 0, 100);
        let zero = rse(&tx, "ZERO", 0, 100);
        tx.add_rse_attribute(heavy, "w", &serde_json::json!(10)).unwrap();
        tx.add_rse_attribute(zero, "w", &serde_json::json!(0)).unwrap();

        let candidates: HashSet<RseId> = [heavy, zero].into_iter().collect();
        let chosen = select_destinations(&tx, &candidates, &HashSet::new(), 1, Some("w"), &file).unwrap();
        assert_eq!(chosen, vec![heavy]);

        let both = select_destinations(&tx, &candidates, &HashSet::new(), 2, Some("w"), &file).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn excluded_rses_never_chosen() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let r1 = rse(&tx, "R1", 0, 100);
        let r2 = rse(&tx, "R2", 0, 100);

        let candidates: HashSet<RseId> = [r1, r2].into_iter().collect();
        let exclude: HashSet<RseId> = [r1].into_iter().collect();
        let chosen = select_destinations(&tx, &candidates, &exclude, 1, None, &file).unwrap();
        assert_eq!(chosen, vec![r2]);
    }

    #[allow(dead_code)]
    fn unused_kind_import() -> DidKind {
        DidKind::File
    }
}
