//! The request state machine itself (spec.md §4.5):
//!
//! ```text
//! QUEUED → SUBMITTING → SUBMITTED → {DONE, FAILED, LOST}
//!                 ↘ SUBMISSION_FAILED
//! ```

use catalog::request::{Request, RequestId, RequestState};
use catalog::Transaction;
use serde_json::json;

use crate::error::ConveyorError;
use crate::monitor::{add_monitor_message, MonitorSink};
use crate::transfer_tool::FileStatus;

/// Applies one poller-reported file status to the request it names.
/// Returns `true` if the request actually transitioned.
///
/// An empty `new_state` means "nothing changed, just refresh `updated_at`"
/// (spec.md: "If `new_state` is empty → touch only"). A transfer_id
/// mismatch, a same-state report, or an already-terminal request are all
/// silently ignored — the poller may be replaying a stale bulk response.
pub fn update_request_state(
    tx: &Transaction<'_>,
    sink: &dyn MonitorSink,
    request_id: RequestId,
    transfer_id: &str,
    status: &FileStatus,
) -> Result<bool, ConveyorError> {
    let Some(new_state) = status.new_state else {
        tx.touch_request(request_id)?;
        return Ok(false);
    };

    let request = tx.get_request(request_id)?;
    if request.external_id.as_deref() != Some(transfer_id) {
        return Ok(false);
    }
    if request.state == new_state || request.state.is_terminal() {
        return Ok(false);
    }

    tx.set_request_state(request_id, new_state)?;
    if status.src_url.is_some() || status.dst_url.is_some() || status.job_m_replica {
        tx.set_request_transfer_info(request_id, status.src_url.as_deref(), status.dst_url.as_deref(), status.job_m_replica)?;
    }

    let event_type = match new_state {
        RequestState::Done => "transfer-done",
        RequestState::Failed => "transfer-failed",
        RequestState::Lost => "transfer-lost",
        _ => "transfer-update",
    };
    add_monitor_message(
        tx,
        sink,
        event_type,
        json!({
            "request_id": request_id.0,
            "scope": request.scope,
            "name": request.name,
            "transfer_id": transfer_id,
            "reason": status.reason,
        }),
    )?;
    Ok(true)
}

/// Whether a terminally-failed or stuck request still has retries left,
/// against the operator-configured `retry_limit` (spec.md §6).
pub fn should_retry_request(request: &Request, retry_limit: i32) -> bool {
    request.retry_count < retry_limit
}
