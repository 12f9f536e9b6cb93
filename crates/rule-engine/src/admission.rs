//! Rule admission: resolves a new rule's candidate RSE set, expands its
//! DIDs, validates quota, grounds every destination and persists the rule
//! (spec.md §4.4 "Admission").

use std::collections::{HashMap, HashSet};

use catalog::did::Did;
use catalog::lock::{DatasetLock, LockState};
use catalog::rule::{Grouping, Rule, RuleId, RuleState};
use catalog::Transaction;
use log::info;
use rse_expr::Evaluator;
use uuid::Uuid;

use crate::error::RuleEngineError;
use crate::expand::expand_to_files;
use crate::grounding::ground_one;
use crate::grouping;

/// Parameters for a new rule, mirroring `add_rule`'s public signature
/// (spec.md §4.4 "Public operations").
pub struct NewRule {
    pub account: String,
    pub dids: Vec<Did>,
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: Grouping,
    pub weight_attr: Option<String>,
    pub lifetime_seconds: Option<i64>,
    pub locked: bool,
    pub subscription_id: Option<Uuid>,
}

/// Admits one rule: resolves `R`, expands `dids` to the leaf file set,
/// checks for a duplicate, plans and validates destinations against
/// account quota, then grounds every `(file, rse)` pair and persists the
/// rule with its final counters/state.
pub fn add_rule(tx: &mut Transaction<'_>, evaluator: &Evaluator, spec: NewRule) -> Result<RuleId, RuleEngineError> {
    reject_duplicate(tx, &spec)?;

    let candidates = evaluator.evaluate(&spec.rse_expression, tx)?;
    let files = expand_to_files(&spec.dids, tx)?;
    let destinations = grouping::plan(tx, spec.grouping, &files, &candidates, spec.copies as usize, spec.weight_attr.as_deref(), &HashMap::new())?;

    validate_quota(tx, &spec.account, &files, &destinations)?;

    let rule_id = RuleId::new();
    let expires_at = spec.lifetime_seconds.map(|s| chrono::Utc::now() + chrono::Duration::seconds(s));
    tx.add_rule(&Rule {
        id: rule_id,
        account: spec.account.clone(),
        dids: spec.dids.clone(),
        copies: spec.copies,
        rse_expression: spec.rse_expression.clone(),
        grouping: spec.grouping,
        weight_attr: spec.weight_attr.clone(),
        lifetime_seconds: spec.lifetime_seconds,
        locked: spec.locked,
        subscription_id: spec.subscription_id,
        state: RuleState::Replicating,
        locks_ok_cnt: 0,
        locks_replicating_cnt: 0,
        locks_stuck_cnt: 0,
        expires_at,
    })?;

    let mut ok_cnt = 0i64;
    let mut replicating_cnt = 0i64;
    // (dataset, rse) -> whether every lock contributed to it so far is OK.
    let mut dataset_lock_state: HashMap<(Did, catalog::rse::RseId), bool> = HashMap::new();

    for f in &files {
        let Some(chosen) = destinations.get(&f.file) else { continue };
        for &rse_id in chosen {
            let state = ground_one(tx, rule_id, &f.file, rse_id)?;
            match state {
                LockState::Ok => ok_cnt += 1,
                LockState::Replicating => replicating_cnt += 1,
                LockState::Stuck => unreachable!("grounding never produces a STUCK lock"),
            }
            tx.queue_counter_delta(&catalog::account::AccountCounterDelta {
                account: spec.account.clone(),
                rse_id,
                bytes_delta: tx.get_did(&f.file)?.bytes.unwrap_or(0) as i64,
                files_delta: 1,
            })?;

            if spec.grouping != Grouping::None {
                let entry = dataset_lock_state.entry((f.dataset.clone(), rse_id)).or_insert(true);
                *entry = *entry && state == LockState::Ok;
            }
        }
    }

    for ((dataset, rse_id), all_ok) in dataset_lock_state {
        tx.add_dataset_lock(&DatasetLock {
            rule_id: rule_id.0,
            rse_id,
            dataset,
            state: if all_ok { LockState::Ok } else { LockState::Replicating },
        })?;
    }

    let mut rule = tx.get_rule(rule_id)?.ok_or(RuleEngineError::RuleNotFound(rule_id.0))?;
    rule.locks_ok_cnt = ok_cnt;
    rule.locks_replicating_cnt = replicating_cnt;
    rule.state = rule.derive_state();
    tx.update_rule(&rule, true)?;

    info!("admitted rule {} for {}: {} locks OK, {} REPLICATING", rule_id, spec.account, ok_cnt, replicating_cnt);
    Ok(rule_id)
}

/// Admits several rules atomically: the caller runs this within a single
/// transaction and rolls the whole batch back if any rule fails
/// (spec.md §4.4 "`add_rules`... atomic multi-rule, all-or-nothing").
pub fn add_rules(tx: &mut Transaction<'_>, evaluator: &Evaluator, specs: Vec<NewRule>) -> Result<Vec<RuleId>, RuleEngineError> {
    specs.into_iter().map(|spec| add_rule(tx, evaluator, spec)).collect()
}

fn reject_duplicate(tx: &Transaction<'_>, spec: &NewRule) -> Result<(), RuleEngineError> {
    let existing = tx.list_rules_by_account(&spec.account)?;
    let new_dids: HashSet<&Did> = spec.dids.iter().collect();
    for rule in existing {
        let rule_dids: HashSet<&Did> = rule.dids.iter().collect();
        if rule_dids == new_dids && rule.rse_expression == spec.rse_expression && rule.copies == spec.copies && rule.grouping == spec.grouping {
            return Err(RuleEngineError::DuplicateRule(format!("account {} already has an equivalent rule ({})", spec.account, rule.id)));
        }
    }
    Ok(())
}

fn validate_quota(tx: &Transaction<'_>, account: &str, files: &[crate::expand::FileDid], destinations: &HashMap<Did, Vec<catalog::rse::RseId>>) -> Result<(), RuleEngineError> {
    let mut bytes_by_rse: HashMap<catalog::rse::RseId, i64> = HashMap::new();
    for f in files {
        let Some(chosen) = destinations.get(&f.file) else { continue };
        let bytes = tx.get_did(&f.file)?.bytes.unwrap_or(0) as i64;
        for &rse_id in chosen {
            *bytes_by_rse.entry(rse_id).or_default() += bytes;
        }
    }
    for (rse_id, new_bytes) in bytes_by_rse {
        if let Some(limit) = tx.get_account_limit(account, rse_id)? {
            let counter = tx.get_account_counter(account, rse_id)?;
            let remaining = limit - counter.bytes;
            if new_bytes > remaining {
                return Err(RuleEngineError::InsufficientAccountLimit(format!(
                    "account {} needs {} bytes at RSE {} but only {} remain",
                    account, new_bytes, rse_id, remaining
                )));
            }
        }
    }
    Ok(())
}
