//! Bulk-polls outstanding transfers for one external host and applies
//! each reported status (spec.md §4.5 "Poller").

use log::warn;
use serde_json::json;

use catalog::request::RequestState;
use catalog::Transaction;
use daemon::ShardSpec;

use crate::error::ConveyorError;
use crate::monitor::{add_monitor_message, MonitorSink};
use crate::state_machine::update_request_state;
use crate::transfer_tool::{TransferOutcome, TransferTool};

/// Polls every outstanding `external_id` this shard owns for
/// `external_host` and applies the reported outcome, returning how many
/// requests actually transitioned state.
pub fn poll_transfers(
    tx: &Transaction<'_>,
    sink: &dyn MonitorSink,
    tool: &dyn TransferTool,
    external_host: &str,
    shard: ShardSpec,
) -> Result<usize, ConveyorError> {
    let external_ids = tx.list_outstanding_external_ids(external_host, shard)?;
    if external_ids.is_empty() {
        return Ok(0);
    }

    let outcomes = tool.bulk_query(external_host, &external_ids)?;
    let mut transitioned = 0;

    for transfer_id in &external_ids {
        match outcomes.get(transfer_id) {
            None | Some(TransferOutcome::Lost) => {
                for request_id in tx.touch_transfer(external_host, transfer_id, RequestState::Lost)? {
                    add_monitor_message(tx, sink, "transfer-lost", json!({ "request_id": request_id.0, "transfer_id": transfer_id }))?;
                    transitioned += 1;
                }
            }
            Some(TransferOutcome::Error(reason)) => {
                warn!("{}: bulk query for transfer {} failed: {}", external_host, transfer_id, reason);
            }
            Some(TransferOutcome::Files(statuses)) => {
                for status in statuses {
                    if update_request_state(tx, sink, status.request_id, transfer_id, status)? {
                        transitioned += 1;
                    }
                }
            }
        }

        // "In all cases, touch-transfer to refresh last seen timestamp"
        // (spec.md §4.5). Requests already transitioned above are touched
        // again here, which is harmless: it's the same refresh either way.
        for request_id in tx.get_requests_by_transfer(external_host, transfer_id)? {
            tx.touch_request(request_id)?;
        }
    }

    Ok(transitioned)
}
