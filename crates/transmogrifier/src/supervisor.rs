//! Reads pending DIDs in bounded chunks and drives them through the
//! worker pool, resubmitting a batch once if every job in it failed
//! (spec.md §4.6 "Supervisor failure policy").

use log::{error, info, warn};
use uuid::Uuid;

use catalog::Store;
use rule_engine::RuleEngine;

use crate::config::Config;
use crate::error::TransmogrifierError;
use crate::job::{Job, JobStatus};
use crate::queue::WorkQueue;
use crate::worker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub dispatched: usize,
    pub completed: usize,
    pub given_up: usize,
}

pub struct Supervisor {
    store: Store,
    queue: WorkQueue,
    config: Config,
}

impl Supervisor {
    pub fn new(store: Store, engine: RuleEngine, config: Config) -> Self {
        let worker_store = store.clone();
        let worker_engine = engine.clone();
        let queue = WorkQueue::spawn(config.worker_count, config.worker_count * 2, move |job: &Job| {
            worker::process_job(&worker_store, &worker_engine, job)
        });
        Supervisor { store, queue, config }
    }

    /// One supervisor tick: list pending DIDs (capped at `maxdids`),
    /// chunk them (capped at `chunksize`), and dispatch every chunk,
    /// retrying a wholly-failed batch once before giving up.
    pub async fn run_once(&self) -> Result<SupervisorStats, TransmogrifierError> {
        let (dids, subscriptions) = {
            let tx = self.store.transaction()?;
            let dids = tx.list_pending_dids(self.config.maxdids)?;
            let subscriptions = tx.list_active_subscriptions()?;
            tx.commit()?;
            (dids, subscriptions)
        };

        if dids.is_empty() {
            return Ok(SupervisorStats::default());
        }

        let mut jobs: Vec<Job> = dids
            .chunks(self.config.chunksize)
            .map(|chunk| Job { id: Uuid::new_v4(), dids: chunk.to_vec(), subscriptions: subscriptions.clone() })
            .collect();

        let mut stats = SupervisorStats { dispatched: jobs.len(), completed: 0, given_up: 0 };
        let mut attempt = 0;

        loop {
            let results = self.dispatch_batch(jobs).await;
            let total = results.len();
            let (completed, failed): (Vec<_>, Vec<_>) =
                results.into_iter().partition(|(_, status)| *status == JobStatus::Complete);
            stats.completed += completed.len();

            if failed.is_empty() {
                break;
            }

            if failed.len() == total && attempt < self.config.max_resubmissions {
                attempt += 1;
                warn!("transmogrifier: entire batch of {} job(s) failed, resubmitting (attempt {})", failed.len(), attempt);
                jobs = failed.into_iter().map(|(job, _)| job).collect();
                continue;
            }

            error!("transmogrifier: giving up on {} job(s) after {} resubmission(s)", failed.len(), attempt);
            stats.given_up += failed.len();
            break;
        }

        info!("transmogrifier: tick complete, {}/{} jobs completed, {} given up", stats.completed, stats.dispatched, stats.given_up);
        Ok(stats)
    }

    async fn dispatch_batch(&self, jobs: Vec<Job>) -> Vec<(Job, JobStatus)> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let queue = self.queue.clone();
            let job_for_submit = job.clone();
            handles.push((job, tokio::spawn(async move { queue.submit(job_for_submit).await })));
        }

        let mut out = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            let status = handle.await.unwrap_or(JobStatus::Failed);
            out.push((job, status));
        }
        out
    }
}
