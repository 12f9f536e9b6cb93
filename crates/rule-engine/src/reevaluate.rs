//! Incremental re-evaluation: brings a rule's locks back in sync with
//! what admission would produce today, without redoing work already
//! done (spec.md §4.4 "Re-evaluation").

use std::collections::{HashMap, HashSet};

use catalog::did::Did;
use catalog::lock::LockState;
use catalog::rule::{Grouping, RuleId, RuleState};
use catalog::{CatalogError, Transaction};
use log::{debug, info};
use rse_expr::Evaluator;

use crate::error::RuleEngineError;
use crate::expand::expand_to_files;
use crate::grounding::ground_one;
use crate::grouping;

/// Re-evaluates `rule_id`: re-resolves its RSE expression, re-expands its
/// DIDs, computes which `(file, rse)` destinations are still missing
/// relative to `copies`, grounds exactly those, and persists the rule's
/// updated counters and state.
///
/// Acquires the rule's row lock for the whole operation with `nowait =
/// true`; contention returns [`RuleEngineError::Defer`] rather than an
/// error, so a re-evaluation daemon can simply requeue the rule for its
/// next tick (spec.md §4.4 "Failure semantics").
pub fn re_evaluate_rule(tx: &mut Transaction<'_>, evaluator: &Evaluator, rule_id: RuleId) -> Result<(), RuleEngineError> {
    match tx.lock_rule(rule_id, true) {
        Ok(()) => {}
        Err(CatalogError::LockContention(_)) => {
            debug!("rule {} is already being evaluated, deferring", rule_id);
            return Err(RuleEngineError::Defer(format!("rule {} is already being evaluated", rule_id)));
        }
        Err(e) => return Err(e.into()),
    }

    let rule = tx.get_rule(rule_id)?.ok_or(RuleEngineError::RuleNotFound(rule_id.0))?;
    if rule.state == RuleState::Suspended {
        return Ok(());
    }

    let candidates = evaluator.evaluate(&rule.rse_expression, tx)?;
    let files = expand_to_files(&rule.dids, tx)?;

    let existing_locks = tx.list_locks_for_rule(rule_id)?;
    let mut already_locked: HashMap<Did, HashSet<catalog::rse::RseId>> = HashMap::new();
    for lock in &existing_locks {
        already_locked.entry(lock.did.clone()).or_default().insert(lock.rse_id);
    }

    let delta = grouping::plan(tx, rule.grouping, &files, &candidates, rule.copies as usize, rule.weight_attr.as_deref(), &already_locked)?;

    let mut ok_cnt = existing_locks.iter().filter(|l| l.state == LockState::Ok).count() as i64;
    let mut replicating_cnt = existing_locks.iter().filter(|l| l.state == LockState::Replicating).count() as i64;
    let stuck_cnt = existing_locks.iter().filter(|l| l.state == LockState::Stuck).count() as i64;

    for f in &files {
        let Some(new_rses) = delta.get(&f.file) else { continue };
        for &rse_id in new_rses {
            let state = ground_one(tx, rule_id, &f.file, rse_id)?;
            match state {
                LockState::Ok => ok_cnt += 1,
                LockState::Replicating => replicating_cnt += 1,
                LockState::Stuck => unreachable!("grounding never produces a STUCK lock"),
            }
            if rule.grouping != Grouping::None {
                tx.add_dataset_lock(&catalog::lock::DatasetLock {
                    rule_id: rule_id.0,
                    rse_id,
                    dataset: f.dataset.clone(),
                    state,
                })?;
            }
        }
    }

    let mut rule = rule;
    rule.locks_ok_cnt = ok_cnt;
    rule.locks_replicating_cnt = replicating_cnt;
    rule.locks_stuck_cnt = stuck_cnt;
    rule.state = rule.derive_state();
    info!("re-evaluated rule {}: now {:?} ({} OK, {} REPLICATING, {} STUCK)", rule_id, rule.state, ok_cnt, replicating_cnt, stuck_cnt);
    tx.update_rule(&rule, true)?;
    Ok(())
}

/// Re-evaluation trigger for a file newly attached to an **open** dataset
/// covered by `rule_id` (spec.md §4.4.1, supplemented from
/// `test_rule.py`): equivalent to a full re-evaluation, since the newly
/// attached file simply widens the rule's expanded file set.
pub fn on_file_attached(tx: &mut Transaction<'_>, evaluator: &Evaluator, rule_id: RuleId, _dataset: &Did, _file: &Did) -> Result<(), RuleEngineError> {
    re_evaluate_rule(tx, evaluator, rule_id)
}
