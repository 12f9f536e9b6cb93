use serde_json::json;
use uuid::Uuid;

use catalog::did::{Did, DidKind, DidRecord};
use catalog::rse::Rse;
use catalog::rule::Grouping;
use catalog::subscription::{RuleTemplate, Subscription, SubscriptionState};
use catalog::Store;
use rse_expr::Evaluator;
use rule_engine::RuleEngine;

use crate::config::Config;
use crate::job::JobStatus;
use crate::supervisor::Supervisor;

fn new_rse(store: &Store, name: &str) -> catalog::rse::RseId {
    let id = catalog::rse::RseId(Uuid::new_v4());
    let tx = store.transaction().unwrap();
    tx.add_rse(&Rse {
        id,
        name: name.to_string(),
        deterministic: true,
        volatile: false,
        availability_read: true,
        availability_write: true,
        availability_delete: true,
        usage_used: 0,
        usage_total: 1000,
    })
    .unwrap();
    tx.add_rse_attribute(id, "tier", &json!(1)).unwrap();
    tx.commit().unwrap();
    id
}

#[tokio::test]
async fn matching_dataset_gets_a_rule_and_is_marked_processed() {
    let store = Store::open_in_memory().unwrap();
    new_rse(&store, "RSE1");

    let did = Did::new("data17_13TeV", "data17_13TeV.physics.DAOD.1");
    {
        let tx = store.transaction().unwrap();
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();
        tx.set_did_metadata(&did, "datatype", &json!("DAOD_PHYS")).unwrap();
        tx.add_subscription(&Subscription {
            id: Uuid::new_v4(),
            account: "panda".into(),
            filter: json!({"scope": ["data17_13TeV"], "datatype": ["DAOD_PHYS"]}),
            replication_rules: vec![RuleTemplate {
                copies: 1,
                rse_expression: "tier=1".to_string(),
                grouping: Some(Grouping::None),
                weight_attr: None,
                lifetime_seconds: None,
            }],
            state: SubscriptionState::Active,
            last_processed: None,
        })
        .unwrap();
        tx.commit().unwrap();
    }

    let engine = RuleEngine::new(store.clone(), Evaluator::new());
    let supervisor = Supervisor::new(store.clone(), engine, Config { chunksize: 10, maxdids: 10, worker_count: 2, max_resubmissions: 1 });

    let stats = supervisor.run_once().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.given_up, 0);

    let tx = store.transaction().unwrap();
    let pending = tx.list_pending_dids(10).unwrap();
    assert!(pending.is_empty(), "matched DID should be marked processed");
}

#[tokio::test]
async fn non_matching_did_creates_no_rule_but_is_still_processed() {
    let store = Store::open_in_memory().unwrap();
    let did = Did::new("mc16_13TeV", "mc16.unrelated.1");
    {
        let tx = store.transaction().unwrap();
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();
        tx.add_subscription(&Subscription {
            id: Uuid::new_v4(),
            account: "panda".into(),
            filter: json!({"scope": ["data17_13TeV"]}),
            replication_rules: vec![RuleTemplate {
                copies: 1,
                rse_expression: "tier=1".to_string(),
                grouping: None,
                weight_attr: None,
                lifetime_seconds: None,
            }],
            state: SubscriptionState::Active,
            last_processed: None,
        })
        .unwrap();
        tx.commit().unwrap();
    }

    let engine = RuleEngine::new(store.clone(), Evaluator::new());
    let supervisor = Supervisor::new(store.clone(), engine, Config::default());

    let stats = supervisor.run_once().await.unwrap();
    assert_eq!(stats.completed, 1);

    let tx = store.transaction().unwrap();
    assert!(tx.list_pending_dids(10).unwrap().is_empty());
    assert!(tx.list_rules_by_account("panda").unwrap().is_empty());
}

#[tokio::test]
async fn empty_pending_queue_is_a_no_op() {
    let store = Store::open_in_memory().unwrap();
    let engine = RuleEngine::new(store.clone(), Evaluator::new());
    let supervisor = Supervisor::new(store, engine, Config::default());
    let stats = supervisor.run_once().await.unwrap();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.completed, 0);
}

#[test]
fn job_status_equality() {
    assert_eq!(JobStatus::Complete, JobStatus::Complete);
    assert_ne!(JobStatus::Complete, JobStatus::Failed);
}
