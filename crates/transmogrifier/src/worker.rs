//! Per-job processing: evaluate every DID in a chunk against the
//! subscription snapshot it was dispatched with, and mint rules for every
//! match (spec.md §4.6).

use log::warn;

use catalog::did::{Did, DidKind};
use catalog::rule::Grouping;
use catalog::Store;
use rule_engine::{NewRule, RuleEngine};

use crate::error::TransmogrifierError;
use crate::filter;
use crate::job::{Job, JobStatus};

/// Runs `job` to completion. Catalog I/O failure on any DID fails the
/// whole job (returned as `Failed`, letting the supervisor decide whether
/// to resubmit); a single subscription's rule-template failure is logged
/// and skipped without failing the job (spec.md §4.6 `InvalidReplicationRule`).
pub fn process_job(store: &Store, engine: &RuleEngine, job: &Job) -> JobStatus {
    for did in &job.dids {
        if let Err(e) = process_one(store, engine, job, did) {
            warn!("transmogrifier: job {} failed on {}: {}", job.id, did, e);
            return JobStatus::Failed;
        }
    }
    JobStatus::Complete
}

fn process_one(store: &Store, engine: &RuleEngine, job: &Job, did: &Did) -> Result<(), TransmogrifierError> {
    let record = {
        let tx = store.transaction()?;
        let record = tx.get_did(did)?;
        tx.commit()?;
        record
    };

    // Files never carry the dataset/container metadata subscriptions
    // filter on (spec.md §4.6 "for each non-file DID in the chunk").
    if record.kind != DidKind::File {
        let metadata = {
            let tx = store.transaction()?;
            let metadata = tx.get_did_metadata(did)?;
            tx.commit()?;
            metadata
        };

        for sub in &job.subscriptions {
            if !filter::matches(&sub.filter, did, &metadata) {
                continue;
            }
            for template in &sub.replication_rules {
                let new_rule = NewRule {
                    account: sub.account.clone(),
                    dids: vec![did.clone()],
                    copies: template.copies,
                    rse_expression: template.rse_expression.clone(),
                    grouping: template.grouping.unwrap_or(Grouping::None),
                    weight_attr: template.weight_attr.clone(),
                    lifetime_seconds: template.lifetime_seconds,
                    locked: false,
                    subscription_id: Some(sub.id),
                };
                if let Err(e) = engine.add_rule(new_rule) {
                    warn!("transmogrifier: invalid replication rule for subscription {} on {}: {}", sub.id, did, e);
                }
            }
        }
    }

    let tx = store.transaction()?;
    tx.mark_did_processed(did)?;
    tx.commit()?;
    Ok(())
}
