//! Picks `QUEUED` requests, submits them in bulk to one external host,
//! and records the outcome (spec.md §4.5 "Submitter").

use chrono::{DateTime, Utc};
use log::{info, warn};

use catalog::request::{RequestState, RequestType};
use catalog::Transaction;
use daemon::ShardSpec;

use crate::error::ConveyorError;
use crate::transfer_tool::{TransferJob, TransferTool};

/// Submits every `QUEUED` request this shard owns to `external_host` in
/// one bulk call, returning how many were handed off (successfully or
/// not — a rejected submission still counts as handled).
pub fn submit_queued(
    tx: &Transaction<'_>,
    tool: &dyn TransferTool,
    external_host: &str,
    shard: ShardSpec,
    older_than: DateTime<Utc>,
) -> Result<usize, ConveyorError> {
    let requests = tx.get_next(&[RequestType::Transfer, RequestType::Stagein, RequestType::Stageout], RequestState::Queued, older_than, shard)?;
    if requests.is_empty() {
        return Ok(0);
    }

    for r in &requests {
        tx.set_request_state(r.id, RequestState::Submitting)?;
    }

    let jobs: Vec<TransferJob> = requests
        .iter()
        .map(|r| TransferJob {
            request_id: r.id,
            scope: r.scope.clone(),
            name: r.name.clone(),
            src_url: r.src_url.clone(),
            dest_url: r.dest_url.clone(),
            bytes: r.bytes,
            activity: r.activity.clone(),
        })
        .collect();

    let submissions = tool.submit(external_host, &jobs)?;
    for submission in &submissions {
        match &submission.external_id {
            Some(external_id) => tx.set_request_submitted(submission.request_id, external_host, external_id)?,
            None => {
                warn!("submission rejected for request {}", submission.request_id);
                tx.set_request_state(submission.request_id, RequestState::SubmissionFailed)?;
            }
        }
    }

    info!("{}: submitted {} requests", external_host, submissions.len());
    Ok(submissions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::{Did, DidRecord};
    use catalog::request::{Request, RequestId};
    use catalog::rse::RseId;
    use catalog::Store;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::transfer_tool::{Submission, TransferOutcome};

    struct FakeTool {
        reject: bool,
        submitted: Mutex<Vec<TransferJob>>,
    }

    impl TransferTool for FakeTool {
        fn submit(&self, _host: &str, jobs: &[TransferJob]) -> Result<Vec<Submission>, ConveyorError> {
            self.submitted.lock().unwrap().extend_from_slice(jobs);
            Ok(jobs
                .iter()
                .map(|j| Submission { request_id: j.request_id, external_id: if self.reject { None } else { Some("ext-1".to_string()) } })
                .collect())
        }

        fn bulk_query(&self, _host: &str, _ids: &[String]) -> Result<HashMap<String, TransferOutcome>, ConveyorError> {
            Ok(HashMap::new())
        }
    }

    fn queued_request() -> Request {
        Request {
            id: RequestId::new(),
            request_type: RequestType::Transfer,
            scope: "s".into(),
            name: "file.1".into(),
            dest_rse_id: RseId(Uuid::new_v4()),
            src_rse_id: None,
            rule_id: Uuid::new_v4(),
            attempt_id: 0,
            state: RequestState::Queued,
            external_host: None,
            external_id: None,
            retry_count: 0,
            dest_url: "davs://dest/file.1".into(),
            src_url: None,
            previous_attempt_id: None,
            activity: "default".into(),
            bytes: 10,
            adler32: None,
            md5: None,
            job_m_replica: false,
            updated_at: Utc::now() - chrono::Duration::seconds(60),
        }
    }

    #[test]
    fn submits_and_records_external_id() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        tx.insert_did(&DidRecord::new_file(Did::new("s", "file.1"), 10, None, None)).unwrap();
        let req = queued_request();
        tx.insert_request(&req).unwrap();

        let tool = FakeTool { reject: false, submitted: Mutex::new(Vec::new()) };
        let n = submit_queued(&tx, &tool, "fts.example.org", ShardSpec::SINGLE, Utc::now()).unwrap();
        assert_eq!(n, 1);
        let updated = tx.get_request(req.id).unwrap();
        assert_eq!(updated.state, RequestState::Submitted);
        assert_eq!(updated.external_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn rejected_submission_marks_submission_failed() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        tx.insert_did(&DidRecord::new_file(Did::new("s", "file.1"), 10, None, None)).unwrap();
        let req = queued_request();
        tx.insert_request(&req).unwrap();

        let tool = FakeTool { reject: true, submitted: Mutex::new(Vec::new()) };
        submit_queued(&tx, &tool, "fts.example.org", ShardSpec::SINGLE, Utc::now()).unwrap();
        assert_eq!(tx.get_request(req.id).unwrap().state, RequestState::SubmissionFailed);
    }
}
