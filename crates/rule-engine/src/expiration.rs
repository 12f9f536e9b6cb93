//! Periodic sweep that deletes expired, unlocked rules (spec.md §4.4
//! "Expiration").

use chrono::{DateTime, Utc};

use catalog::rule::RuleId;
use catalog::Transaction;

use crate::deletion::delete_rule;
use crate::error::RuleEngineError;

/// Deletes every rule with `expires_at <= now` and `locked = false`,
/// returning the ids actually deleted. Meant to be called once per
/// `Ticker` tick by the expiration daemon.
pub fn sweep_expired(tx: &Transaction<'_>, now: DateTime<Utc>) -> Result<Vec<RuleId>, RuleEngineError> {
    let mut deleted = Vec::new();
    for rule_id in tx.list_expired_rules(now)? {
        delete_rule(tx, rule_id)?;
        deleted.push(rule_id);
    }
    Ok(deleted)
}
