//! Transfer requests: the unit of work the conveyor daemons move through
//! the submit/poll/finish pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rse::RseId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Transfer,
    Stagein,
    Stageout,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Transfer => "TRANSFER",
            RequestType::Stagein => "STAGEIN",
            RequestType::Stageout => "STAGEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TRANSFER" => RequestType::Transfer,
            "STAGEIN" => RequestType::Stagein,
            "STAGEOUT" => RequestType::Stageout,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Submitting,
    Submitted,
    Done,
    Failed,
    Lost,
    NoSources,
    SubmissionFailed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Queued => "QUEUED",
            RequestState::Submitting => "SUBMITTING",
            RequestState::Submitted => "SUBMITTED",
            RequestState::Done => "DONE",
            RequestState::Failed => "FAILED",
            RequestState::Lost => "LOST",
            RequestState::NoSources => "NO_SOURCES",
            RequestState::SubmissionFailed => "SUBMISSION_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "QUEUED" => RequestState::Queued,
            "SUBMITTING" => RequestState::Submitting,
            "SUBMITTED" => RequestState::Submitted,
            "DONE" => RequestState::Done,
            "FAILED" => RequestState::Failed,
            "LOST" => RequestState::Lost,
            "NO_SOURCES" => RequestState::NoSources,
            "SUBMISSION_FAILED" => RequestState::SubmissionFailed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done | RequestState::Failed | RequestState::Lost)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub request_type: RequestType,
    pub scope: String,
    pub name: String,
    pub dest_rse_id: RseId,
    pub src_rse_id: Option<RseId>,
    pub rule_id: Uuid,
    pub attempt_id: i32,
    pub state: RequestState,
    pub external_host: Option<String>,
    pub external_id: Option<String>,
    pub retry_count: i32,
    pub dest_url: String,
    pub src_url: Option<String>,
    pub previous_attempt_id: Option<Uuid>,
    pub activity: String,
    pub bytes: u64,
    pub adler32: Option<String>,
    pub md5: Option<String>,
    /// Set once the external tool reports `job_m_replica=true` on this
    /// request's transfer: several sources were offered and the finisher
    /// must resolve which one actually served the bytes from `src_url`
    /// (spec.md §4.5 "Source resolution for multi-source transfers").
    pub job_m_replica: bool,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
