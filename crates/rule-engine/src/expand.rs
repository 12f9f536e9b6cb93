//! Recursive expansion of a rule's root DIDs down to the leaf file set
//! (spec.md §4.4 "Admission": "For each root DID, it expands recursively
//! to the leaf file set F (containers → datasets → files)"), grounded on
//! `test_rule.py`'s `get_rule_cleaned_dids`.

use std::collections::HashSet;

use catalog::did::{Did, DidKind};
use catalog::Transaction;

use crate::error::RuleEngineError;

/// A leaf file DID, tagged with the dataset that directly contains it
/// (needed by `DATASET`/`ALL` grouping to pick shared destinations per
/// dataset).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDid {
    pub file: Did,
    pub dataset: Did,
}

/// Expands `roots` (files, datasets, or containers) to their constituent
/// file set. A root that is itself a file contributes itself, tagged
/// with itself as its own "dataset" (no containing dataset above it).
pub fn expand_to_files(roots: &[Did], tx: &Transaction<'_>) -> Result<Vec<FileDid>, RuleEngineError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for root in roots {
        expand_one(root, root, tx, &mut out, &mut seen)?;
    }
    Ok(out)
}

fn expand_one(
    current: &Did,
    nearest_dataset: &Did,
    tx: &Transaction<'_>,
    out: &mut Vec<FileDid>,
    seen: &mut HashSet<Did>,
) -> Result<(), RuleEngineError> {
    let record = tx.get_did(current).map_err(RuleEngineError::from)?;
    match record.kind {
        DidKind::File => {
            if seen.insert(current.clone()) {
                out.push(FileDid { file: current.clone(), dataset: nearest_dataset.clone() });
            }
            Ok(())
        }
        DidKind::Dataset => {
            for child in tx.list_children(current).map_err(RuleEngineError::from)? {
                expand_one(&child, current, tx, out, seen)?;
            }
            Ok(())
        }
        DidKind::Container => {
            for child in tx.list_children(current).map_err(RuleEngineError::from)? {
                expand_one(&child, nearest_dataset, tx, out, seen)?;
            }
            Ok(())
        }
    }
}
