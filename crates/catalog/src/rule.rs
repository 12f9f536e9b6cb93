//! Replication rules: the unit of "keep N copies of this data here".

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::did::Did;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        RuleId(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grouping {
    None,
    Dataset,
    All,
}

impl Grouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::None => "NONE",
            Grouping::Dataset => "DATASET",
            Grouping::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "NONE" => Grouping::None,
            "DATASET" => Grouping::Dataset,
            "ALL" => Grouping::All,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleState {
    Replicating,
    Ok,
    Stuck,
    Suspended,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Replicating => "REPLICATING",
            RuleState::Ok => "OK",
            RuleState::Stuck => "STUCK",
            RuleState::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "REPLICATING" => RuleState::Replicating,
            "OK" => RuleState::Ok,
            "STUCK" => RuleState::Stuck,
            "SUSPENDED" => RuleState::Suspended,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub account: String,
    pub dids: Vec<Did>,
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: Grouping,
    pub weight_attr: Option<String>,
    pub lifetime_seconds: Option<i64>,
    pub locked: bool,
    pub subscription_id: Option<Uuid>,
    pub state: RuleState,
    pub locks_ok_cnt: i64,
    pub locks_replicating_cnt: i64,
    pub locks_stuck_cnt: i64,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Rule {
    pub fn total_locks(&self) -> i64 {
        self.locks_ok_cnt + self.locks_replicating_cnt + self.locks_stuck_cnt
    }

    /// `state = Ok ⇔ locks_replicating = 0 ∧ locks_stuck = 0` (spec.md §3
    /// "Rule"). Derives the state a rule's counters imply; callers persist
    /// it via `update_rule`.
    pub fn derive_state(&self) -> RuleState {
        if self.locks_stuck_cnt > 0 {
            RuleState::Stuck
        } else if self.locks_replicating_cnt > 0 {
            RuleState::Replicating
        } else {
            RuleState::Ok
        }
    }
}
