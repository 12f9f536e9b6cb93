//! Applies a rule's `Grouping` policy to a leaf file set, turning the
//! per-file-independent destination selection in [`crate::destination`]
//! into the shared-destination semantics `DATASET` and `ALL` call for
//! (spec.md §4.4 "Grouping").

use std::collections::{HashMap, HashSet};

use catalog::did::Did;
use catalog::rse::RseId;
use catalog::rule::Grouping;
use catalog::Transaction;

use crate::destination::select_destinations;
use crate::error::RuleEngineError;
use crate::expand::FileDid;

/// Per-file plan of *new* destinations: every file in `files` gets an
/// entry (possibly empty), even under `DATASET`/`ALL` grouping where
/// several files map to the same vector of RSEs. `copies` is the rule's
/// total target per group; `already_locked` is subtracted both from the
/// candidate pool and from the count still needed, so calling this with
/// an empty `already_locked` (admission) yields `copies` fresh picks per
/// group, while calling it with a rule's current locks (re-evaluation)
/// yields exactly the delta still missing — grounding code never needs
/// to know whether it's handling an admission or a re-evaluation.
pub fn plan(
    tx: &Transaction<'_>,
    grouping: Grouping,
    files: &[FileDid],
    candidates: &HashSet<RseId>,
    copies: usize,
    weight_attr: Option<&str>,
    already_locked: &HashMap<Did, HashSet<RseId>>,
) -> Result<HashMap<Did, Vec<RseId>>, RuleEngineError> {
    let mut plan = HashMap::new();
    match grouping {
        Grouping::None => {
            for f in files {
                let exclude = already_locked.get(&f.file).cloned().unwrap_or_default();
                let needed = copies.saturating_sub(exclude.len());
                let chosen = select_destinations(tx, candidates, &exclude, needed, weight_attr, &f.file)?;
                plan.insert(f.file.clone(), chosen);
            }
        }
        Grouping::Dataset => {
            for group in group_by(files, |f| f.dataset.clone()).into_values() {
                let exclude = union_excludes(&group, already_locked);
                let needed = copies.saturating_sub(exclude.len());
                let representative = &group[0].file;
                let chosen = select_destinations(tx, candidates, &exclude, needed, weight_attr, representative)?;
                for f in &group {
                    plan.insert(f.file.clone(), chosen.clone());
                }
            }
        }
        Grouping::All => {
            if let Some(first) = files.first() {
                let exclude = union_excludes(files, already_locked);
                let needed = copies.saturating_sub(exclude.len());
                let chosen = select_destinations(tx, candidates, &exclude, needed, weight_attr, &first.file)?;
                for f in files {
                    plan.insert(f.file.clone(), chosen.clone());
                }
            }
        }
    }
    Ok(plan)
}

fn group_by<K: std::hash::Hash + Eq>(files: &[FileDid], key: impl Fn(&FileDid) -> K) -> HashMap<K, Vec<FileDid>> {
    let mut groups: HashMap<K, Vec<FileDid>> = HashMap::new();
    for f in files {
        groups.entry(key(f)).or_default().push(f.clone());
    }
    groups
}

fn union_excludes(files: &[FileDid], already_locked: &HashMap<Did, HashSet<RseId>>) -> HashSet<RseId> {
    let mut union = HashSet::new();
    for f in files {
        if let Some(set) = already_locked.get(&f.file) {
            union.extend(set.iter().copied());
        }
    }
    union
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{DidKind, DidRecord};
    use catalog::rse::Rse;
    use catalog::Store;
    use uuid::Uuid;

    fn rse(tx: &Transaction<'_>, name: &str) -> RseId {
        let id = RseId(Uuid::new_v4());
        tx.add_rse(&Rse {
            id,
            name: name.to_string(),
            deterministic: true,
            volatile: false,
            availability_read: true,
            availability_write: true,
            availability_delete: true,
            usage_used: 0,
            usage_total: 100,
        })
        .unwrap();
        id
    }

    fn setup_two_file_dataset(tx: &Transaction<'_>) -> (Did, Vec<FileDid>) {
        let dataset = Did::new("s", "dataset.1");
        let file_a = Did::new("s", "file.a");
        let file_b = Did::new("s", "file.b");
        tx.insert_did(&DidRecord::new_collection(dataset.clone(), DidKind::Dataset, false)).unwrap();
        tx.insert_did(&DidRecord::new_file(file_a.clone(), 10, None, None)).unwrap();
        tx.insert_did(&DidRecord::new_file(file_b.clone(), 10, None, None)).unwrap();
        tx.attach_children(&dataset, &[file_a.clone(), file_b.clone()]).unwrap();
        (
            dataset.clone(),
            vec![
                FileDid { file: file_a, dataset: dataset.clone() },
                FileDid { file: file_b, dataset },
            ],
        )
    }

    #[test]
    fn dataset_grouping_shares_one_destination_set_across_files() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let (_dataset, files) = setup_two_file_dataset(&tx);
        let r1 = rse(&tx, "R1");
        let r2 = rse(&tx, "R2");
        let candidates: HashSet<RseId> = [r1, r2].into_iter().collect();

        let result = plan(&tx, Grouping::Dataset, &files, &candidates, 1, None, &HashMap::new()).unwrap();
        assert_eq!(result.len(), 2);
        let chosen: Vec<_> = result.values().collect();
        assert_eq!(chosen[0], chosen[1], "both files of the dataset must land on the same RSE");
    }

    #[test]
    fn none_grouping_lets_each_file_pick_independently() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let (_dataset, files) = setup_two_file_dataset(&tx);
        let r1 = rse(&tx, "R1");
        let candidates: HashSet<RseId> = [r1].into_iter().collect();

        let result = plan(&tx, Grouping::None, &files, &candidates, 1, None, &HashMap::new()).unwrap();
        assert_eq!(result.len(), 2);
        for f in &files {
            assert_eq!(result[&f.file], vec![r1]);
        }
    }
}
