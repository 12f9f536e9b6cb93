//! A unit of supervisor-to-worker dispatch: a chunk of newly registered
//! DIDs plus the subscription snapshot to evaluate them against
//! (spec.md §4.6: "Each worker receives a chunk plus the current list of
//! `ACTIVE` subscriptions").

use catalog::did::Did;
use catalog::subscription::Subscription;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub dids: Vec<Did>,
    pub subscriptions: Vec<Subscription>,
}

/// Mirrors the external work queue's reported status (spec.md §6:
/// "reports per-job status in `{PENDING, RUNNING, COMPLETE, FAILED}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failed,
}
