//! Resolves a parsed expression against the catalog's RSE attributes, with
//! a process-local cache keyed by expression string (spec.md §4.2:
//! "Evaluator is pure and cacheable by expression string, with
//! invalidation on any RSE-attribute mutation").

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use catalog::rse::RseId;
use catalog::Transaction;

use crate::ast::{self, Atom, Expr};
use crate::error::RseExprError;

/// Caches the resolved RSE-id set for each expression string seen so far.
/// `invalidate()` must be called by any writer of RSE attributes
/// (`catalog::Transaction::add_rse_attribute` / `del_rse_attribute`)
/// before the next evaluation; the evaluator itself never touches
/// attributes except to read them.
#[derive(Clone, Default)]
pub struct Evaluator {
    cache: Arc<Mutex<std::collections::HashMap<String, HashSet<RseId>>>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator::default()
    }

    /// Drops every cached result. Called whenever any RSE attribute is
    /// added or removed, since that can change any atom's resolved set.
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Evaluates `expression` against the given transaction's attribute
    /// tables, returning the resolved RSE-id set. An empty result is not
    /// an error (spec.md §4.2); malformed syntax fails with
    /// `InvalidRSEExpression`.
    pub fn evaluate(&self, expression: &str, tx: &Transaction<'_>) -> Result<HashSet<RseId>, RseExprError> {
        if let Some(hit) = self.cache.lock().get(expression) {
            return Ok(hit.clone());
        }
        let parsed = ast::parse(expression)?;
        let resolved = eval_expr(&parsed, tx)?;
        self.cache.lock().insert(expression.to_string(), resolved.clone());
        Ok(resolved)
    }
}

fn eval_expr(expr: &Expr, tx: &Transaction<'_>) -> Result<HashSet<RseId>, RseExprError> {
    match expr {
        Expr::Atom(atom) => eval_atom(atom, tx),
        Expr::And(l, r) => {
            let l = eval_expr(l, tx)?;
            let r = eval_expr(r, tx)?;
            Ok(l.intersection(&r).copied().collect())
        }
        Expr::Or(l, r) => {
            let l = eval_expr(l, tx)?;
            let r = eval_expr(r, tx)?;
            Ok(l.union(&r).copied().collect())
        }
        Expr::Diff(l, r) => {
            let l = eval_expr(l, tx)?;
            let r = eval_expr(r, tx)?;
            Ok(l.difference(&r).copied().collect())
        }
    }
}

fn eval_atom(atom: &Atom, tx: &Transaction<'_>) -> Result<HashSet<RseId>, RseExprError> {
    match atom {
        Atom::Exists(key) => Ok(tx.rse_ids_with_attribute_key(key)?.into_iter().collect()),
        Atom::Eq(key, value) => filter_by(key, value, tx, |cmp| cmp == std::cmp::Ordering::Equal),
        Atom::Lt(key, value) => filter_by(key, value, tx, |cmp| cmp == std::cmp::Ordering::Less),
        Atom::Gt(key, value) => filter_by(key, value, tx, |cmp| cmp == std::cmp::Ordering::Greater),
    }
}

fn filter_by(
    key: &str,
    value: &str,
    tx: &Transaction<'_>,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<HashSet<RseId>, RseExprError> {
    let candidates = tx.rse_ids_with_attribute_key(key)?;
    let mut out = HashSet::new();
    for rse_id in candidates {
        if let Some(actual) = tx.rse_attribute_value(rse_id, key)? {
            if let Some(ordering) = compare_values(&actual, value) {
                if accept(ordering) {
                    out.insert(rse_id);
                }
            }
        }
    }
    Ok(out)
}

/// Compares a stored attribute value against an atom's literal string.
/// Numeric comparison wins when both sides parse as numbers (the common
/// case: `tier<3`, weights); otherwise falls back to string comparison of
/// the stored value's textual form.
fn compare_values(actual: &Value, literal: &str) -> Option<std::cmp::Ordering> {
    let actual_text = match actual {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if let (Ok(a), Ok(b)) = (actual_text.parse::<f64>(), literal.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    Some(actual_text.as_str().cmp(literal))
}

#[cfg(test)]
mod tests {
    use super::*;
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
            usage_total: 0,
        })
        .unwrap();
        id
    }

    #[test]
    fn evaluates_union_and_difference() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let r1 = rse(&tx, "R1");
        let r3 = rse(&tx, "R3");
        let r5 = rse(&tx, "R5");
        let _r4 = rse(&tx, "R4");
        tx.add_rse_attribute(r1, "t1", &serde_json::json!(true)).unwrap();
        tx.add_rse_attribute(r3, "t1", &serde_json::json!(true)).unwrap();
        tx.add_rse_attribute(r5, "t1", &serde_json::json!(true)).unwrap();
        tx.add_rse_attribute(r1, "blacklisted", &serde_json::json!(true)).unwrap();

        let evaluator = Evaluator::new();
        let result = evaluator.evaluate("t1\\blacklisted", &tx).unwrap();
        assert_eq!(result, [r3, r5].into_iter().collect());
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let evaluator = Evaluator::new();
        let result = evaluator.evaluate("nonexistent=value", &tx).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn invalid_syntax_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let evaluator = Evaluator::new();
        assert!(matches!(evaluator.evaluate("(unbalanced", &tx), Err(RseExprError::InvalidRSEExpression(_))));
    }

    #[test]
    fn caches_by_expression_string() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let r1 = rse(&tx, "R1");
        tx.add_rse_attribute(r1, "tier", &serde_json::json!("2")).unwrap();

        let evaluator = Evaluator::new();
        let first = evaluator.evaluate("tier=2", &tx).unwrap();
        // Mutate without invalidating: the cached result should not change.
        let r2 = rse(&tx, "R2");
        tx.add_rse_attribute(r2, "tier", &serde_json::json!("2")).unwrap();
        let second = evaluator.evaluate("tier=2", &tx).unwrap();
        assert_eq!(first, second);

        evaluator.invalidate();
        let third = evaluator.evaluate("tier=2", &tx).unwrap();
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn numeric_comparison_for_lt_gt() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let r1 = rse(&tx, "R1");
        let r2 = rse(&tx, "R2");
        tx.add_rse_attribute(r1, "tier", &serde_json::json!("1")).unwrap();
        tx.add_rse_attribute(r2, "tier", &serde_json::json!("2")).unwrap();

        let evaluator = Evaluator::new();
        let result = evaluator.evaluate("tier<2", &tx).unwrap();
        assert_eq!(result, [r1].into_iter().collect());
    }
}
