//! Replica locks and their dataset-level companions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::did::Did;
use crate::rse::RseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Replicating,
    Ok,
    Stuck,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Replicating => "REPLICATING",
            LockState::Ok => "OK",
            LockState::Stuck => "STUCK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "REPLICATING" => LockState::Replicating,
            "OK" => LockState::Ok,
            "STUCK" => LockState::Stuck,
            _ => return None,
        })
    }
}

/// A lock held by a rule over a single file DID at a single RSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub rule_id: Uuid,
    pub rse_id: RseId,
    pub did: Did,
    pub state: LockState,
}

/// Companion lock over a whole dataset, present when the owning rule's
/// grouping is `Dataset` or `All`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLock {
    pub rule_id: Uuid,
    pub rse_id: RseId,
    pub dataset: Did,
    pub state: LockState,
}
