use chrono::Utc;
use uuid::Uuid;

use crate::account::AccountCounterDelta;
use crate::did::{Did, DidKind, DidRecord};
use crate::error::CatalogError;
use crate::replica::{Replica, ReplicaState};
use crate::request::{Request, RequestId, RequestState, RequestType};
use crate::rse::{Rse, RseId};
use crate::rule::{Grouping, Rule, RuleId, RuleState};
use crate::store::Store;

fn new_rse(store: &crate::Transaction<'_>, name: &str) -> RseId {
    let id = RseId(Uuid::new_v4());
    store
        .add_rse(&Rse {
            id,
            name: name.to_string(),
            deterministic: true,
            volatile: false,
            availability_read: true,
            availability_write: true,
            availability_delete: true,
            usage_used: 0,
            usage_total: 0,
        })
        .unwrap();
    id
}

#[test]
fn attaching_the_same_child_twice_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let dataset = Did::new("data13_tev", "dataset.1");
    let file = Did::new("data13_tev", "file.1");
    tx.insert_did(&DidRecord::new_collection(dataset.clone(), DidKind::Dataset, false)).unwrap();
    tx.insert_did(&DidRecord::new_file(file.clone(), 1024, None, None)).unwrap();
    tx.attach_children(&dataset, &[file.clone()]).unwrap();

    let err = tx.attach_children(&dataset, &[file]).unwrap_err();
    assert!(matches!(err, CatalogError::Duplicate(_)));
}

#[test]
fn attaching_a_cycle_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let container = Did::new("s", "container.1");
    let dataset = Did::new("s", "dataset.1");
    tx.insert_did(&DidRecord::new_collection(container.clone(), DidKind::Container, false)).unwrap();
    tx.insert_did(&DidRecord::new_collection(dataset.clone(), DidKind::Dataset, false)).unwrap();
    tx.attach_children(&container, &[dataset.clone()]).unwrap();

    let err = tx.attach_children(&dataset, &[container]).unwrap_err();
    assert!(matches!(err, CatalogError::UnsupportedOperation(_)));
}

#[test]
fn monotonic_dataset_cannot_be_reopened() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let dataset = Did::new("s", "dataset.1");
    tx.insert_did(&DidRecord::new_collection(dataset.clone(), DidKind::Dataset, true)).unwrap();
    tx.set_did_open(&dataset, false).unwrap();

    let err = tx.set_did_open(&dataset, true).unwrap_err();
    assert!(matches!(err, CatalogError::UnsupportedStatus(_)));
}

#[test]
fn non_monotonic_dataset_can_be_reopened() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let dataset = Did::new("s", "dataset.1");
    tx.insert_did(&DidRecord::new_collection(dataset.clone(), DidKind::Dataset, false)).unwrap();
    tx.set_did_open(&dataset, false).unwrap();
    tx.set_did_open(&dataset, true).unwrap();
    assert!(tx.get_did(&dataset).unwrap().is_open);
}

#[test]
fn duplicate_rse_attribute_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rse_id = new_rse(&tx, "CERN-PROD_DATADISK");
    tx.add_rse_attribute(rse_id, "tier", &serde_json::json!("2")).unwrap();

    let err = tx.add_rse_attribute(rse_id, "tier", &serde_json::json!("3")).unwrap_err();
    assert!(matches!(err, CatalogError::Duplicate(_)));
}

#[test]
fn lock_cnt_tracks_locks_and_zero_allows_tombstone() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rse_id = new_rse(&tx, "RAL-LCG2_DATADISK");
    let file = Did::new("s", "file.1");
    tx.insert_did(&DidRecord::new_file(file.clone(), 2048, None, None)).unwrap();
    tx.add_replica(&Replica {
        rse_id,
        did: file.clone(),
        state: ReplicaState::Available,
        bytes: 2048,
        adler32: None,
        md5: None,
        path: None,
        tombstone: None,
        lock_cnt: 0,
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
    tx.add_lock(&crate::lock::Lock { rule_id: rule_id.0, rse_id, did: file.clone(), state: crate::lock::LockState::Replicating }).unwrap();

    assert_eq!(tx.get_replica(rse_id, &file).unwrap().lock_cnt, 1);

    tx.delete_rule(rule_id).unwrap();
    let replica = tx.get_replica(rse_id, &file).unwrap();
    assert_eq!(replica.lock_cnt, 0);
    assert!(!replica.reapable(), "tombstone not yet set by delete_rule, only lock_cnt cleared");
    let _ = tx.rollback();
}

#[test]
fn locked_rule_cannot_be_deleted() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rule_id = RuleId::new();
    tx.add_rule(&Rule {
        id: rule_id,
        account: "atlas".into(),
        dids: vec![],
        copies: 1,
        rse_expression: "tier=2".into(),
        grouping: Grouping::None,
        weight_attr: None,
        lifetime_seconds: None,
        locked: true,
        subscription_id: None,
        state: RuleState::Ok,
        locks_ok_cnt: 0,
        locks_replicating_cnt: 0,
        locks_stuck_cnt: 0,
        expires_at: None,
    })
    .unwrap();

    let err = tx.delete_rule(rule_id).unwrap_err();
    assert!(matches!(err, CatalogError::UnsupportedOperation(_)));
}

#[test]
fn explicit_rule_lock_does_not_self_contend_with_update_rule() {
    let store = Store::open_in_memory().unwrap();
    let mut tx = store.transaction().unwrap();
    let rule_id = RuleId::new();
    tx.add_rule(&Rule {
        id: rule_id,
        account: "atlas".into(),
        dids: vec![],
        copies: 1,
        rse_expression: "tier=2".into(),
        grouping: Grouping::None,
        weight_attr: None,
        lifetime_seconds: None,
        locked: false,
        subscription_id: None,
        state: RuleState::Replicating,
        locks_ok_cnt: 0,
        locks_replicating_cnt: 0,
        locks_stuck_cnt: 0,
        expires_at: None,
    })
    .unwrap();

    tx.lock_rule(rule_id, true).unwrap();
    let mut rule = tx.get_rule(rule_id).unwrap().unwrap();
    rule.state = RuleState::Ok;
    // update_rule acquires the same advisory lock internally; it must not
    // contend with the explicit lock_rule call above within one transaction.
    tx.update_rule(&rule, true).unwrap();
}

fn sample_request(rule_id: Uuid, dest_rse_id: RseId) -> Request {
    Request {
        id: RequestId::new(),
        request_type: RequestType::Transfer,
        scope: "data13_tev".into(),
        name: "file.1".into(),
        dest_rse_id,
        src_rse_id: None,
        rule_id,
        attempt_id: 0,
        state: RequestState::Queued,
        external_host: None,
        external_id: None,
        retry_count: 0,
        dest_url: "https://example.test/file.1".into(),
        src_url: None,
        previous_attempt_id: None,
        activity: "Data Brokering".into(),
        bytes: 1024,
        adler32: None,
        md5: None,
        job_m_replica: false,
        updated_at: Utc::now(),
    }
}

#[test]
fn second_non_terminal_request_for_the_same_target_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rse_id = new_rse(&tx, "BNL-OSG2_DATADISK");
    let rule_id = Uuid::new_v4();
    let first = sample_request(rule_id, rse_id);
    tx.insert_request(&first).unwrap();

    let second = sample_request(rule_id, rse_id);
    let err = tx.insert_request(&second).unwrap_err();
    assert!(matches!(err, CatalogError::Duplicate(_)));
}

#[test]
fn requeue_and_archive_produces_a_linked_retry() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rse_id = new_rse(&tx, "NDGF-T1_DATADISK");
    let rule_id = Uuid::new_v4();
    let mut request = sample_request(rule_id, rse_id);
    request.state = RequestState::Failed;
    let original_id = request.id;
    tx.insert_request(&request).unwrap();

    let retry_id = tx.requeue_and_archive(original_id).unwrap();
    let retry = tx.get_request(retry_id).unwrap();
    assert_eq!(retry.previous_attempt_id, Some(original_id.0));
    assert_eq!(retry.attempt_id, 1);
    assert_eq!(retry.state, RequestState::Queued);
    assert!(tx.get_request(original_id).is_err(), "archived request no longer lives in the active table");
}

#[test]
fn counter_deltas_are_summed_before_being_applied() {
    let store = Store::open_in_memory().unwrap();
    let tx = store.transaction().unwrap();
    let rse_id = new_rse(&tx, "IN2P3-CC_DATADISK");
    tx.queue_counter_delta(&AccountCounterDelta { account: "atlas".into(), rse_id, bytes_delta: 100, files_delta: 1 }).unwrap();
    tx.queue_counter_delta(&AccountCounterDelta { account: "atlas".into(), rse_id, bytes_delta: 50, files_delta: 1 }).unwrap();

    let applied = tx.apply_counter_deltas().unwrap();
    assert_eq!(applied, 2);
    let counter = tx.get_account_counter("atlas", rse_id).unwrap();
    assert_eq!(counter.bytes, 150);
    assert_eq!(counter.files, 2);
}

#[test]
fn rollback_on_drop_discards_uncommitted_writes() {
    let store = Store::open_in_memory().unwrap();
    let rse_id;
    {
        let tx = store.transaction().unwrap();
        rse_id = new_rse(&tx, "TRIUMF-LCG2_DATADISK");
        // tx dropped here without commit() or rollback()
    }
    let tx = store.transaction().unwrap();
    let err = tx.del_rse_attribute(rse_id, "tier").unwrap_err();
    assert!(matches!(err, CatalogError::RseNotFound(_)));
}
