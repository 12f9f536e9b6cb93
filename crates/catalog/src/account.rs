//! Eventually-consistent usage accounting: account/RSE counters maintained
//! by draining a queued delta table in batch, instead of updating an
//! aggregate row on every write.

use serde::{Deserialize, Serialize};

use crate::rse::RseId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCounter {
    pub account: String,
    pub rse_id: RseId,
    pub bytes: i64,
    pub files: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLimit {
    pub account: String,
    pub rse_id: RseId,
    pub bytes_limit: i64,
}

/// A not-yet-applied change to an account/RSE counter. `apply_counter_deltas`
/// sums these per `(account, rse_id)` and folds them into the aggregate in
/// one pass, matching the spec's "writes enqueue deltas that a reducer
/// applies in batch".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCounterDelta {
    pub account: String,
    pub rse_id: RseId,
    pub bytes_delta: i64,
    pub files_delta: i64,
}
