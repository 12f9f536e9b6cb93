//! The transfer request state machine and its submit/poll/finish/stage
//! sub-daemons, on top of [`catalog`] (spec.md §4.5).

pub mod error;
pub mod finisher;
pub mod monitor;
pub mod path;
pub mod poller;
pub mod source;
pub mod stager;
pub mod state_machine;
pub mod submitter;
pub mod transfer_tool;

pub use error::ConveyorError;
pub use monitor::{MonitorSink, NullMonitorSink};
pub use state_machine::{should_retry_request, update_request_state};
pub use transfer_tool::{FileStatus, NullTransferTool, Submission, TransferJob, TransferOutcome, TransferTool};

use chrono::{DateTime, Utc};
use catalog::Store;
use daemon::ShardSpec;

/// Finisher/stager reconciliation knobs (spec.md §6): how many times a
/// failed or stuck request is retried before it's given up on, and how
/// long a request may sit in `SUBMITTING` before it's considered stuck.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub retry_limit: i32,
    pub submit_stuck_timeout_secs: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig { retry_limit: 3, submit_stuck_timeout_secs: 1800 }
    }
}

/// Convenience facade bundling a [`Store`] handle with a [`TransferTool`]
/// and a [`MonitorSink`]; each method opens its own transaction and
/// commits on success, same pattern as `rule_engine::RuleEngine`.
pub struct Conveyor {
    store: Store,
    tool: Box<dyn TransferTool>,
    sink: Box<dyn MonitorSink>,
    reconcile: ReconcileConfig,
}

impl Conveyor {
    pub fn new(store: Store, tool: Box<dyn TransferTool>, sink: Box<dyn MonitorSink>, reconcile: ReconcileConfig) -> Self {
        Conveyor { store, tool, sink, reconcile }
    }

    /// Submitter tick: hands every `QUEUED` request this shard owns,
    /// touched before `older_than`, to `external_host` in one bulk call.
    pub fn submit(&self, external_host: &str, shard: ShardSpec, older_than: DateTime<Utc>) -> Result<usize, ConveyorError> {
        let tx = self.store.transaction()?;
        let n = submitter::submit_queued(&tx, self.tool.as_ref(), external_host, shard, older_than)?;
        tx.commit()?;
        Ok(n)
    }

    /// Poller tick: bulk-queries every outstanding transfer for
    /// `external_host` and applies the reported outcomes.
    pub fn poll(&self, external_host: &str, shard: ShardSpec) -> Result<usize, ConveyorError> {
        let tx = self.store.transaction()?;
        let n = poller::poll_transfers(&tx, self.sink.as_ref(), self.tool.as_ref(), external_host, shard)?;
        tx.commit()?;
        Ok(n)
    }

    /// Finisher tick: reconciles every terminal/stuck `TRANSFER` request
    /// this shard owns.
    pub fn finish(&self, shard: ShardSpec) -> Result<usize, ConveyorError> {
        let mut tx = self.store.transaction()?;
        let n = finisher::finish_requests(&mut tx, self.sink.as_ref(), shard, self.reconcile.retry_limit, self.reconcile.submit_stuck_timeout_secs)?;
        tx.commit()?;
        Ok(n)
    }

    /// Stager tick: reconciles every terminal/stuck `STAGEIN`/`STAGEOUT`
    /// request this shard owns.
    pub fn stage(&self, shard: ShardSpec) -> Result<usize, ConveyorError> {
        let mut tx = self.store.transaction()?;
        let n = stager::finish_staging_requests(&mut tx, self.sink.as_ref(), shard, self.reconcile.retry_limit, self.reconcile.submit_stuck_timeout_secs)?;
        tx.commit()?;
        Ok(n)
    }
}
