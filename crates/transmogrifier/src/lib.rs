//! Subscription matcher ("transmogrifier"): scans newly registered DIDs,
//! matches them against active subscriptions, and synthesizes rules,
//! dispatched to a worker pool (spec.md §4.6).

pub mod config;
pub mod error;
pub mod filter;
pub mod job;
pub mod queue;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use error::TransmogrifierError;
pub use job::{Job, JobStatus};
pub use queue::WorkQueue;
pub use supervisor::{Supervisor, SupervisorStats};

#[cfg(test)]
mod tests;
