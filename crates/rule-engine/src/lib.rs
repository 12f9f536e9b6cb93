//! Replication rule admission, grounding, re-evaluation and teardown on
//! top of [`catalog`] and [`rse_expr`].

pub mod admission;
pub mod deletion;
pub mod destination;
pub mod error;
pub mod expand;
pub mod expiration;
pub mod grounding;
pub mod grouping;
pub mod reevaluate;

pub use admission::{add_rule, add_rules, NewRule};
pub use deletion::delete_rule;
pub use error::RuleEngineError;
pub use expand::{expand_to_files, FileDid};
pub use expiration::sweep_expired;
pub use reevaluate::{on_file_attached, re_evaluate_rule};

use catalog::rule::RuleId;
use catalog::Store;
use rse_expr::Evaluator;

/// Convenience facade bundling a [`Store`] handle with the
/// [`Evaluator`] every rule-engine operation needs; each method opens
/// its own transaction and commits on success, rolling back on any
/// error via [`Transaction`](catalog::Transaction)'s drop guard.
#[derive(Clone)]
pub struct RuleEngine {
    store: Store,
    evaluator: Evaluator,
}

impl RuleEngine {
    pub fn new(store: Store, evaluator: Evaluator) -> Self {
        RuleEngine { store, evaluator }
    }

    pub fn add_rule(&self, spec: NewRule) -> Result<RuleId, RuleEngineError> {
        let mut tx = self.store.transaction()?;
        let id = admission::add_rule(&mut tx, &self.evaluator, spec)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn add_rules(&self, specs: Vec<NewRule>) -> Result<Vec<RuleId>, RuleEngineError> {
        let mut tx = self.store.transaction()?;
        let ids = admission::add_rules(&mut tx, &self.evaluator, specs)?;
        tx.commit()?;
        Ok(ids)
    }

    pub fn delete_rule(&self, id: RuleId) -> Result<(), RuleEngineError> {
        let tx = self.store.transaction()?;
        deletion::delete_rule(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn re_evaluate_rule(&self, id: RuleId) -> Result<(), RuleEngineError> {
        let mut tx = self.store.transaction()?;
        reevaluate::re_evaluate_rule(&mut tx, &self.evaluator, id)?;
        tx.commit()?;
        Ok(())
    }

    /// Rules the re-evaluation sweep should visit this tick (spec.md §4.4).
    pub fn rules_needing_reevaluation(&self) -> Result<Vec<RuleId>, RuleEngineError> {
        let tx = self.store.transaction()?;
        Ok(tx.list_rules_needing_reevaluation()?)
    }

    pub fn sweep_expired(&self) -> Result<Vec<RuleId>, RuleEngineError> {
        let tx = self.store.transaction()?;
        let ids = expiration::sweep_expired(&tx, chrono::Utc::now())?;
        tx.commit()?;
        Ok(ids)
    }
}
