//! Tunables named in spec.md §6: `chunksize`, `maxdids`, plus the
//! worker-pool sizing and resubmission bound spec.md §4.6/§9 describe
//! without pinning exact numbers.

#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatch at most this many DIDs per chunk/job.
    pub chunksize: usize,
    /// Process at most this many pending DIDs per supervisor tick.
    pub maxdids: usize,
    /// Number of persistent worker tasks consuming the work queue.
    pub worker_count: usize,
    /// How many times a fully-failed batch is resubmitted before the
    /// supervisor gives up and logs critical (spec.md §4.6 "bounded
    /// retry before giving up").
    pub max_resubmissions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config { chunksize: 100, maxdids: 1000, worker_count: 4, max_resubmissions: 1 }
    }
}
