//! In-process work queue: a bounded `mpsc` channel fed by the supervisor
//! and drained by a fixed pool of worker tasks, generalizing spec.md
//! §4.6's "dispatched to a pool of worker processes via a work-queue"
//! (design note §9: "N tokio tasks consuming a bounded channel... failed-
//! job batches are resubmitted once"). The real distributed queue named
//! in spec.md §6 is a separate collaborator; this is the in-process
//! stand-in the supervisor drives directly.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::job::{Job, JobStatus};

struct Envelope {
    job: Job,
    respond_to: oneshot::Sender<JobStatus>,
}

/// Handle to a running worker pool. Cheap to clone — every clone shares
/// the same channel and the same `worker_count` backing tasks.
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<Envelope>,
}

impl WorkQueue {
    /// Spawns `worker_count` tasks, each looping on the shared receiver
    /// and running `handler` against whatever job it dequeues.
    pub fn spawn<H>(worker_count: usize, channel_capacity: usize, handler: H) -> WorkQueue
    where
        H: Fn(&Job) -> JobStatus + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let handler = Arc::new(handler);

        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let envelope = { rx.lock().await.recv().await };
                    let Some(Envelope { job, respond_to }) = envelope else { break };
                    let status = handler(&job);
                    let _ = respond_to.send(status);
                }
            });
        }

        WorkQueue { sender: tx }
    }

    /// Submits `job` and awaits its terminal status. Returns `Failed` if
    /// the pool has gone away (e.g. every worker panicked).
    pub async fn submit(&self, job: Job) -> JobStatus {
        let (respond_to, rx) = oneshot::channel();
        if self.sender.send(Envelope { job, respond_to }).await.is_err() {
            return JobStatus::Failed;
        }
        rx.await.unwrap_or(JobStatus::Failed)
    }
}
