//! External transfer-tool seam (FTS3 in production Rucio): submission and
//! bulk status polling are abstracted behind a trait so the daemons can
//! be exercised without a live transfer service.

use std::collections::HashMap;

use catalog::request::{RequestId, RequestState};

use crate::error::ConveyorError;

/// One file to move, as the submitter hands it to the external tool.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub request_id: RequestId,
    pub scope: String,
    pub name: String,
    pub src_url: Option<String>,
    pub dest_url: String,
    pub bytes: u64,
    pub activity: String,
}

/// Outcome of submitting one job: `external_id = None` means the tool
/// rejected it outright (spec.md §4.5 "On submission error: transitions
/// to `SUBMISSION_FAILED`").
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_id: RequestId,
    pub external_id: Option<String>,
}

/// Per-file terminal status within a bulk poll response.
#[derive(Debug, Clone)]
pub struct FileStatus {
    pub request_id: RequestId,
    pub new_state: Option<RequestState>,
    pub reason: Option<String>,
    pub src_url: Option<String>,
    /// The PFN the tool actually wrote to, used by the finisher to derive
    /// a non-deterministic destination RSE's replica path (spec.md §4.5
    /// "Non-deterministic RSEs").
    pub dst_url: Option<String>,
    /// Set when the tool reports `job_m_replica=true`: several sources
    /// were offered and the actual one served must be resolved from
    /// `src_url` (spec.md §4.5 "Source resolution for multi-source
    /// transfers").
    pub job_m_replica: bool,
}

/// The three shapes a bulk poll response can take for one `transfer_id`
/// (spec.md §4.5 "Poller").
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    /// The external tool has no record of this transfer at all.
    Lost,
    /// The tool returned an error for this transfer; leave it untouched.
    Error(String),
    Files(Vec<FileStatus>),
}

pub trait TransferTool: Send + Sync {
    fn submit(&self, external_host: &str, jobs: &[TransferJob]) -> Result<Vec<Submission>, ConveyorError>;

    /// Bulk-queries status for every `external_id` previously submitted
    /// to `external_host`, keyed by `external_id` in the result map.
    fn bulk_query(&self, external_host: &str, external_ids: &[String]) -> Result<HashMap<String, TransferOutcome>, ConveyorError>;
}

/// Rejects every submission and reports nothing for every poll. Wires the
/// daemon binary when no real FTS3 (or other) client is configured — the
/// concrete tool is out of scope (spec.md §1), same placeholder role as
/// [`crate::monitor::NullMonitorSink`].
pub struct NullTransferTool;

impl TransferTool for NullTransferTool {
    fn submit(&self, _external_host: &str, jobs: &[TransferJob]) -> Result<Vec<Submission>, ConveyorError> {
        Ok(jobs.iter().map(|j| Submission { request_id: j.request_id, external_id: None }).collect())
    }

    fn bulk_query(&self, _external_host: &str, _external_ids: &[String]) -> Result<HashMap<String, TransferOutcome>, ConveyorError> {
        Ok(HashMap::new())
    }
}
