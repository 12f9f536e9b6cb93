//! Turns a destination-selection decision into catalog state: a lock, the
//! replica row it depends on, and — when no `AVAILABLE` replica exists
//! yet — a queued transfer request (spec.md §4.4 "Grounding").

use catalog::did::Did;
use catalog::lock::{Lock, LockState};
use catalog::replica::{Replica, ReplicaState};
use catalog::request::{Request, RequestId, RequestState, RequestType};
use catalog::rse::RseId;
use catalog::rule::RuleId;
use catalog::Transaction;

use crate::error::RuleEngineError;

/// Grounds a single `(file, rse)` destination for `rule_id`, creating the
/// lock (and, if needed, the replica and a `TRANSFER` request) and
/// returning the lock's resulting state so the caller can fold it into
/// the rule's counters.
pub fn ground_one(tx: &Transaction<'_>, rule_id: RuleId, file: &Did, rse_id: RseId) -> Result<LockState, RuleEngineError> {
    let existing = match tx.get_replica(rse_id, file) {
        Ok(replica) => Some(replica),
        Err(catalog::CatalogError::ReplicaNotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };

    let state = if matches!(existing, Some(ref r) if r.state == ReplicaState::Available) {
        LockState::Ok
    } else {
        if existing.is_none() {
            let record = tx.get_did(file)?;
            tx.add_replica(&Replica {
                rse_id,
                did: file.clone(),
                state: ReplicaState::Unavailable,
                bytes: record.bytes.unwrap_or(0),
                adler32: record.adler32,
                md5: record.md5,
                path: None,
                tombstone: None,
                lock_cnt: 0,
            })?;
        }
        enqueue_transfer(tx, rule_id, file, rse_id)?;
        LockState::Replicating
    };

    tx.add_lock(&Lock { rule_id: rule_id.0, rse_id, did: file.clone(), state })?;
    Ok(state)
}

fn enqueue_transfer(tx: &Transaction<'_>, rule_id: RuleId, file: &Did, rse_id: RseId) -> Result<(), RuleEngineError> {
    let record = tx.get_did(file)?;
    tx.insert_request(&Request {
        id: RequestId::new(),
        request_type: RequestType::Transfer,
        scope: file.scope.clone(),
        name: file.name.clone(),
        dest_rse_id: rse_id,
        src_rse_id: None,
        rule_id: rule_id.0,
        attempt_id: 0,
        state: RequestState::Queued,
        external_host: None,
        external_id: None,
        retry_count: 0,
        dest_url: String::new(),
        src_url: None,
        previous_attempt_id: None,
        activity: "default".to_string(),
        bytes: record.bytes.unwrap_or(0),
        adler32: record.adler32,
        md5: record.md5,
        job_m_replica: false,
        updated_at: chrono::Utc::now(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{DidKind, DidRecord};
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
            usage_total: 100,
        })
        .unwrap();
        id
    }

    #[test]
    fn grounds_ok_when_available_replica_exists() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let rse_id = rse(&tx, "R1");
        tx.add_replica(&Replica {
            rse_id,
            did: file.clone(),
            state: ReplicaState::Available,
            bytes: 10,
            adler32: None,
            md5: None,
            path: None,
            tombstone: None,
            lock_cnt: 0,
        })
        .unwrap();

        let rule_id = RuleId::new();
        let state = ground_one(&tx, rule_id, &file, rse_id).unwrap();
        assert_eq!(state, LockState::Ok);
        assert!(tx.list_requests_for_rule(rule_id.0).unwrap().is_empty());
        assert_eq!(tx.get_replica(rse_id, &file).unwrap().lock_cnt, 1);
    }

    #[test]
    fn grounds_replicating_and_enqueues_transfer_when_no_replica() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let rse_id = rse(&tx, "R1");

        let rule_id = RuleId::new();
        let state = ground_one(&tx, rule_id, &file, rse_id).unwrap();
        assert_eq!(state, LockState::Replicating);
        let requests = tx.list_requests_for_rule(rule_id.0).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].dest_rse_id, rse_id);
        let replica = tx.get_replica(rse_id, &file).unwrap();
        assert_eq!(replica.state, ReplicaState::Unavailable);
        assert_eq!(replica.lock_cnt, 1);
    }

    #[allow(dead_code)]
    fn unused(_: DidKind) {}
}
