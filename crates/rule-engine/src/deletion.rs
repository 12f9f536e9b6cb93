//! Rule teardown: releases every lock the rule held, tombstones replicas
//! left with no remaining locks, and cancels the rule's own in-flight
//! transfer requests (spec.md §4.4 "Deletion").

use log::info;

use catalog::request::RequestState;
use catalog::rule::RuleId;
use catalog::Transaction;

use crate::error::RuleEngineError;

/// Deletes `rule_id`. Fails with [`RuleEngineError::AccessDenied`] if the
/// rule is `locked` (spec.md: "If `locked`, fail with `AccessDenied`").
pub fn delete_rule(tx: &Transaction<'_>, rule_id: RuleId) -> Result<(), RuleEngineError> {
    let rule = tx.get_rule(rule_id)?.ok_or(RuleEngineError::RuleNotFound(rule_id.0))?;
    if rule.locked {
        return Err(RuleEngineError::AccessDenied(format!("rule {} is locked", rule_id)));
    }

    let locks = tx.list_locks_for_rule(rule_id)?;

    for request in tx.list_requests_for_rule(rule_id.0)? {
        if !request.state.is_terminal() {
            tx.set_request_state(request.id, RequestState::SubmissionFailed)?;
        }
    }

    tx.delete_rule(rule_id)?;

    for lock in &locks {
        tx.maybe_tombstone(lock.rse_id, &lock.did)?;
    }
    info!("deleted rule {}: released {} locks", rule_id, locks.len());
    Ok(())
}
