//! File replicas and their lifecycle state.

use serde::{Deserialize, Serialize};

use crate::did::Did;
use crate::rse::RseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaState {
    Available,
    Unavailable,
    Copying,
    BeingDeleted,
    Bad,
    Source,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaState::Available => "AVAILABLE",
            ReplicaState::Unavailable => "UNAVAILABLE",
            ReplicaState::Copying => "COPYING",
            ReplicaState::BeingDeleted => "BEING_DELETED",
            ReplicaState::Bad => "BAD",
            ReplicaState::Source => "SOURCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "AVAILABLE" => ReplicaState::Available,
            "UNAVAILABLE" => ReplicaState::Unavailable,
            "COPYING" => ReplicaState::Copying,
            "BEING_DELETED" => ReplicaState::BeingDeleted,
            "BAD" => ReplicaState::Bad,
            "SOURCE" => ReplicaState::Source,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub rse_id: RseId,
    pub did: Did,
    pub state: ReplicaState,
    pub bytes: u64,
    pub adler32: Option<String>,
    pub md5: Option<String>,
    pub path: Option<String>,
    pub tombstone: Option<chrono::DateTime<chrono::Utc>>,
    pub lock_cnt: i64,
}

impl Replica {
    /// `lock_cnt = 0 ⇔ tombstone may be set` (spec.md §3 "Replica").
    pub fn reapable(&self) -> bool {
        self.lock_cnt == 0 && self.tombstone.is_some()
    }
}

/// A batch update target for `Store::update_replicas_states`.
#[derive(Debug, Clone)]
pub struct ReplicaStateUpdate {
    pub rse_id: RseId,
    pub did: Did,
    pub new_state: ReplicaState,
}
