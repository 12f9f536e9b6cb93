//! Stable-hash sharding so multiple worker processes/threads can consume
//! disjoint subsets of rows with no coordination beyond `(index, total)`.

use sha2::{Digest, Sha256};

/// Identifies which slice of the keyspace a worker process/thread owns.
///
/// `process_index < total_processes` and `thread_index < total_threads`;
/// a row belongs to this shard iff its stable hash, reduced modulo
/// `total_processes * total_threads`, lands on
/// `process_index * total_threads + thread_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub process_index: u32,
    pub total_processes: u32,
    pub thread_index: u32,
    pub total_threads: u32,
}

impl ShardSpec {
    /// The trivial shard: a single process, single thread, owns everything.
    pub const SINGLE: ShardSpec = ShardSpec {
        process_index: 0,
        total_processes: 1,
        thread_index: 0,
        total_threads: 1,
    };

    pub fn new(process_index: u32, total_processes: u32, thread_index: u32, total_threads: u32) -> Self {
        assert!(total_processes > 0 && total_threads > 0, "shard totals must be positive");
        assert!(process_index < total_processes && thread_index < total_threads, "shard index out of range");
        ShardSpec { process_index, total_processes, thread_index, total_threads }
    }

    /// Stable hash of any primary key, independent of process memory layout
    /// or `HashMap` iteration order (unlike `std::hash::Hash`).
    pub fn stable_hash(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        u64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest has at least 8 bytes"))
    }

    /// Whether the row identified by `key` belongs to this shard.
    pub fn owns(&self, key: &str) -> bool {
        if self.total_processes == 1 && self.total_threads == 1 {
            return true;
        }
        let slots = u64::from(self.total_processes) * u64::from(self.total_threads);
        let my_slot = u64::from(self.process_index) * u64::from(self.total_threads) + u64::from(self.thread_index);
        Self::stable_hash(key) % slots == my_slot
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        ShardSpec::SINGLE
    }
}
