//! Handles `STAGEIN`/`STAGEOUT` requests analogously to `TRANSFER`,
//! except a `STAGEIN` request's destination replica never transitions
//! (spec.md §4.5 "Stager").

use catalog::request::RequestType;
use catalog::Transaction;
use daemon::ShardSpec;

use crate::error::ConveyorError;
use crate::finisher::finish_requests_of_type;
use crate::monitor::MonitorSink;

/// One stager pass over `STAGEIN`/`STAGEOUT` requests this shard owns.
/// Returns how many requests were handled. `retry_limit` and
/// `submit_stuck_timeout_secs` come from spec.md §6 config.
pub fn finish_staging_requests(
    tx: &mut Transaction<'_>,
    sink: &dyn MonitorSink,
    shard: ShardSpec,
    retry_limit: i32,
    submit_stuck_timeout_secs: i64,
) -> Result<usize, ConveyorError> {
    finish_requests_of_type(tx, sink, &[RequestType::Stagein, RequestType::Stageout], shard, retry_limit, submit_stuck_timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{Did, DidRecord};
    use catalog::lock::{Lock, LockState};
    use catalog::replica::{Replica, ReplicaState};
    use catalog::request::{Request, RequestId, RequestState};
    use catalog::rse::{Rse, RseId};
    use catalog::rule::{Grouping, Rule, RuleId, RuleState};
    use catalog::Store;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use crate::monitor::NullMonitorSink;

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
            usage_total: 100,
        })
        .unwrap();
        id
    }

    fn staging_request(request_type: RequestType, rule_id: Uuid, dest_rse_id: RseId) -> Request {
        Request {
            id: RequestId::new(),
            request_type,
            scope: "s".into(),
            name: "file.1".into(),
            dest_rse_id,
            src_rse_id: None,
            rule_id,
            attempt_id: 0,
            state: RequestState::Done,
            external_host: Some("fts.example.org".into()),
            external_id: Some("tr-1".into()),
            retry_count: 0,
            dest_url: "davs://dest/file.1".into(),
            src_url: None,
            previous_attempt_id: None,
            activity: "default".into(),
            bytes: 10,
            adler32: None,
            md5: None,
            job_m_replica: false,
            updated_at: Utc::now() - Duration::seconds(60),
        }
    }

    #[test]
    fn stagein_done_request_never_flips_the_destination_replica() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let rse_id = rse(&tx, "R1");
        tx.add_replica(&Replica {
            rse_id,
            did: file.clone(),
            state: ReplicaState::Unavailable,
            bytes: 10,
            adler32: None,
            md5: None,
            path: None,
            tombstone: None,
            lock_cnt: 1,
        })
        .unwrap();
        let rule_id = RuleId::new();
        tx.add_rule(&Rule {
            id: rule_id,
            account: "atlas".into(),
            dids: vec![file.clone()],
            copies: 1,
            rse_expression: "tier=2".into(),
            grouping: Grouping::None,
            weight_attr: None,
            lifetime_seconds: None,
            locked: false,
            subscription_id: None,
            state: RuleState::Replicating,
            locks_ok_cnt: 0,
            locks_replicating_cnt: 1,
            locks_stuck_cnt: 0,
            expires_at: None,
        })
        .unwrap();
        tx.add_lock(&Lock { rule_id: rule_id.0, rse_id, did: file.clone(), state: LockState::Replicating }).unwrap();

        let request = staging_request(RequestType::Stagein, rule_id.0, rse_id);
        tx.insert_request(&request).unwrap();

        finish_staging_requests(&mut tx, &NullMonitorSink, ShardSpec::SINGLE, 3, 1800).unwrap();

        // Replica state is untouched by STAGEIN...
        assert_eq!(tx.get_replica(rse_id, &file).unwrap().state, ReplicaState::Unavailable);
        // ...but the lock still grounds, same as TRANSFER.
        let locks = tx.list_locks_for_rule(rule_id).unwrap();
        assert_eq!(locks[0].state, LockState::Ok);
    }

    #[test]
    fn stageout_done_request_flips_the_destination_replica() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let rse_id = rse(&tx, "R1");
        tx.add_replica(&Replica {
            rse_id,
            did: file.clone(),
            state: ReplicaState::Unavailable,
            bytes: 10,
            adler32: None,
            md5: None,
            path: None,
            tombstone: None,
            lock_cnt: 1,
        })
        .unwrap();
        let rule_id = RuleId::new();
        tx.add_rule(&Rule {
            id: rule_id,
            account: "atlas".into(),
            dids: vec![file.clone()],
            copies: 1,
            rse_expression: "tier=2".into(),
            grouping: Grouping::None,
            weight_attr: None,
            lifetime_seconds: None,
            locked: false,
            subscription_id: None,
            state: RuleState::Replicating,
            locks_ok_cnt: 0,
            locks_replicating_cnt: 1,
            locks_stuck_cnt: 0,
            expires_at: None,
        })
        .unwrap();
        tx.add_lock(&Lock { rule_id: rule_id.0, rse_id, did: file.clone(), state: LockState::Replicating }).unwrap();

        let request = staging_request(RequestType::Stageout, rule_id.0, rse_id);
        tx.insert_request(&request).unwrap();

        finish_staging_requests(&mut tx, &NullMonitorSink, ShardSpec::SINGLE, 3, 1800).unwrap();
        assert_eq!(tx.get_replica(rse_id, &file).unwrap().state, ReplicaState::Available);
    }
}
