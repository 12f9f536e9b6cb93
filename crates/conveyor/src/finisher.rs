//! Consumes terminal (and stuck) requests and reconciles catalog state:
//! replica lifecycle, lock state, rule counters, archival (spec.md §4.5
//! "Finisher").

use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::json;

use catalog::did::Did;
use catalog::lock::LockState;
use catalog::replica::{Replica, ReplicaState, ReplicaStateUpdate};
use catalog::request::{Request, RequestState, RequestType};
use catalog::rse::ProtocolOperation;
use catalog::rule::RuleId;
use catalog::{CatalogError, Transaction};
use daemon::ShardSpec;

use crate::error::ConveyorError;
use crate::monitor::{add_monitor_message, MonitorSink};
use crate::path::derive_path;
use crate::source::resolve_source_rse;
use crate::state_machine::should_retry_request;

/// One finisher pass over `TRANSFER` requests: processes every terminal
/// request this shard owns, then requeues any `SUBMITTING` request stuck
/// past `submit_stuck_timeout_secs`. Returns how many requests were
/// handled. `retry_limit` and `submit_stuck_timeout_secs` come from
/// spec.md §6 config (`retry_limit`, `submit_stuck_timeout`).
///
/// `STAGEIN`/`STAGEOUT` requests go through [`crate::stager`] instead,
/// which shares this module's reconciliation helpers but skips the
/// destination replica transition for `STAGEIN` (spec.md §4.5 "Stager").
pub fn finish_requests(
    tx: &mut Transaction<'_>,
    sink: &dyn MonitorSink,
    shard: ShardSpec,
    retry_limit: i32,
    submit_stuck_timeout_secs: i64,
) -> Result<usize, ConveyorError> {
    finish_requests_of_type(tx, sink, &[RequestType::Transfer], shard, retry_limit, submit_stuck_timeout_secs)
}

pub(crate) fn finish_requests_of_type(
    tx: &mut Transaction<'_>,
    sink: &dyn MonitorSink,
    request_types: &[RequestType],
    shard: ShardSpec,
    retry_limit: i32,
    submit_stuck_timeout_secs: i64,
) -> Result<usize, ConveyorError> {
    let now = Utc::now();
    let mut handled = 0;

    let done = tx.get_next(request_types, RequestState::Done, now, shard)?;
    if !done.is_empty() {
        finish_done_batch(tx, sink, &done)?;
        handled += done.len();
    }

    for state in [RequestState::Failed, RequestState::Lost] {
        let requests = tx.get_next(request_types, state, now, shard)?;
        for request in &requests {
            finish_failed_or_lost(tx, sink, request, retry_limit)?;
            handled += 1;
        }
    }

    let stuck_before = now - Duration::seconds(submit_stuck_timeout_secs);
    for request in tx.get_next(request_types, RequestState::Submitting, stuck_before, shard)? {
        if should_retry_request(&request, retry_limit) {
            warn!("request {} stuck in SUBMITTING since {}, requeuing", request.id, request.updated_at);
            let new_id = tx.requeue_and_archive(request.id)?;
            info!("requeued stuck request {} as {}", request.id, new_id);
        } else {
            warn!("request {} stuck in SUBMITTING and out of retries, marking SUBMISSION_FAILED", request.id);
            tx.set_request_state(request.id, RequestState::SubmissionFailed)?;
        }
        handled += 1;
    }

    Ok(handled)
}

/// `DONE`: batch-transitions every destination replica to `AVAILABLE`
/// with `nowait=true`; on `ReplicaNotFound` falls back one-by-one and, if
/// still missing, registers a tombstoned replica (dark-data quarantine)
/// (spec.md §4.5 "Finisher"). `STAGEIN` requests are excluded from the
/// replica transition (spec.md §4.5 "Stager").
pub(crate) fn finish_done_batch(tx: &mut Transaction<'_>, sink: &dyn MonitorSink, requests: &[Request]) -> Result<(), ConveyorError> {
    let updates: Vec<ReplicaStateUpdate> = requests
        .iter()
        .filter(|r| r.request_type != RequestType::Stagein)
        .map(|r| ReplicaStateUpdate { rse_id: r.dest_rse_id, did: Did::new(r.scope.clone(), r.name.clone()), new_state: ReplicaState::Available })
        .collect();

    if !updates.is_empty() {
        if let Err(e) = tx.update_replicas_states(&updates, true) {
            if !matches!(e, CatalogError::ReplicaNotFound { .. } | CatalogError::LockContention(_)) {
                return Err(e.into());
            }
            for update in &updates {
                match tx.update_replicas_states(std::slice::from_ref(update), true) {
                    Ok(()) => {}
                    Err(CatalogError::ReplicaNotFound { .. }) => {
                        warn!("dest replica {}:{} missing at DONE, quarantining as dark data", update.rse_id, update.did);
                        tx.add_replica(&Replica {
                            rse_id: update.rse_id,
                            did: update.did.clone(),
                            state: ReplicaState::Available,
                            bytes: 0,
                            adler32: None,
                            md5: None,
                            path: None,
                            tombstone: Some(Utc::now()),
                            lock_cnt: 0,
                        })?;
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }
    }

    for request in requests {
        finish_done_one(tx, sink, request)?;
    }
    Ok(())
}

fn finish_done_one(tx: &mut Transaction<'_>, sink: &dyn MonitorSink, request: &Request) -> Result<(), ConveyorError> {
    let did = Did::new(request.scope.clone(), request.name.clone());

    // Source resolution for multi-source transfers (spec.md §4.5).
    if request.job_m_replica {
        if let Some(src_url) = &request.src_url {
            match resolve_source_rse(tx, &did, src_url)? {
                Some(src_rse_id) => info!("resolved multi-source transfer {} to source {}", request.id, src_rse_id),
                None => warn!("multi-source transfer {} reported src_url {} matching no known replica", request.id, src_url),
            }
        }
    }

    // Non-deterministic RSE path derivation (spec.md §4.5).
    let dest_rse = tx.get_rse(request.dest_rse_id)?;
    if !dest_rse.deterministic {
        let protocols = tx.list_protocols(request.dest_rse_id)?;
        if let Some(protocol) = catalog::rse::Protocol::select_best(&protocols, ProtocolOperation::Write) {
            if let Some(path) = derive_path(protocol, &request.dest_url) {
                tx.set_replica_path(request.dest_rse_id, &did, &path)?;
            } else {
                warn!("request {}: dest_url {} doesn't match {}'s write protocol, path left unset", request.id, request.dest_url, dest_rse.name);
            }
        }
    }

    let rule_id = RuleId(request.rule_id);
    tx.set_lock_state(rule_id, request.dest_rse_id, &did, LockState::Ok)?;
    let rule = tx.recompute_rule_counters(rule_id, true)?;
    tx.archive_request(request.id)?;
    add_monitor_message(
        tx,
        sink,
        "transfer-done",
        json!({ "request_id": request.id.0, "scope": request.scope, "name": request.name, "rule_id": rule.id.0, "dest_rse_id": request.dest_rse_id.0 }),
    )?;
    Ok(())
}

/// `FAILED`/`LOST`: requeues if retries remain; otherwise marks the
/// destination replica `UNAVAILABLE` (skipped for `STAGEIN`, spec.md
/// §4.5 "Stager"), the lock `STUCK`, and recomputes the rule's counters
/// (which will surface the rule as `STUCK` too) (spec.md §4.5 "Finisher").
pub(crate) fn finish_failed_or_lost(tx: &mut Transaction<'_>, sink: &dyn MonitorSink, request: &Request, retry_limit: i32) -> Result<(), ConveyorError> {
    if should_retry_request(request, retry_limit) {
        let new_id = tx.requeue_and_archive(request.id)?;
        info!("requeued {:?} request {} as {}", request.state, request.id, new_id);
        return Ok(());
    }

    let did = Did::new(request.scope.clone(), request.name.clone());
    if request.request_type != RequestType::Stagein {
        match tx.update_replicas_states(
            &[ReplicaStateUpdate { rse_id: request.dest_rse_id, did: did.clone(), new_state: ReplicaState::Unavailable }],
            true,
        ) {
            Ok(()) | Err(CatalogError::ReplicaNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let rule_id = RuleId(request.rule_id);
    tx.set_lock_state(rule_id, request.dest_rse_id, &did, LockState::Stuck)?;
    let rule = tx.recompute_rule_counters(rule_id, true)?;
    tx.archive_request(request.id)?;
    add_monitor_message(
        tx,
        sink,
        if request.state == RequestState::Lost { "transfer-lost" } else { "transfer-failed" },
        json!({ "request_id": request.id.0, "scope": request.scope, "name": request.name, "rule_id": rule.id.0, "dest_rse_id": request.dest_rse_id.0 }),
    )?;
    Ok(())
}
