//! Storage elements, their attributes and protocols.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RseId(pub Uuid);

impl std::fmt::Display for RseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rse {
    pub id: RseId,
    pub name: String,
    pub deterministic: bool,
    pub volatile: bool,
    pub availability_read: bool,
    pub availability_write: bool,
    pub availability_delete: bool,
    /// Bytes currently occupied / total usable bytes. Used by the rule
    /// engine's free-space-ratio destination tiebreak and by the
    /// placement advisor's ranking formula (spec.md §3 "RSE": "usage/
    /// limits").
    pub usage_used: u64,
    pub usage_total: u64,
}

impl Rse {
    /// Fraction of capacity still free, in `[0.0, 1.0]`. An RSE with no
    /// reported capacity is treated as fully free so a freshly-registered
    /// RSE isn't starved of placements before usage is first reported.
    pub fn free_ratio(&self) -> f64 {
        if self.usage_total == 0 {
            return 1.0;
        }
        let free = self.usage_total.saturating_sub(self.usage_used);
        free as f64 / self.usage_total as f64
    }
}

/// A single RSE attribute. Values come back from SQLite as JSON so any of
/// string/number/bool can round-trip, matching the teacher's
/// `rule_json`-as-text-column pattern in `bridge.rs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RseAttribute {
    pub rse_id: RseId,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolOperation {
    Read,
    Write,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub rse_id: RseId,
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub prefix: String,
    pub impl_: String,
    pub priority_read: i32,
    pub priority_write: i32,
    pub priority_delete: i32,
    pub extended_attributes: Option<Value>,
}

impl Protocol {
    /// Priority for the given operation, lower wins, ties broken by scheme
    /// name (spec.md §3 "Protocol").
    pub fn priority_for(&self, op: ProtocolOperation) -> (i32, &str) {
        let p = match op {
            ProtocolOperation::Read => self.priority_read,
            ProtocolOperation::Write => self.priority_write,
            ProtocolOperation::Delete => self.priority_delete,
        };
        (p, self.scheme.as_str())
    }

    /// Picks the best protocol for `op` among `candidates`, per the
    /// lowest-priority-number-wins / scheme-name-tiebreak rule.
    pub fn select_best(candidates: &[Protocol], op: ProtocolOperation) -> Option<&Protocol> {
        candidates.iter().min_by(|a, b| a.priority_for(op).cmp(&b.priority_for(op)))
    }
}
