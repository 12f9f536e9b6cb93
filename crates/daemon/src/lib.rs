//! Shared scaffolding for Rucio control-plane daemons.
//!
//! Every long-running role (rule re-evaluator, conveyor submitter/poller/
//! finisher/stager, transmogrifier supervisor, c3po ticker) is built from
//! the same three primitives: a stable-hash based [`ShardSpec`] so disjoint
//! worker processes/threads can consume disjoint rows without coordination,
//! a [`GracefulStop`] flag polled between fixed-interval [`Ticker`] ticks,
//! and [`backoff::jittered_backoff`] for a caller to sleep off transient
//! row-lock contention (spec.md §7 "Transient DB") before its next tick,
//! so workers contending on the same row don't retry in lockstep. The
//! ticker itself stays a plain fixed interval; only the rule re-evaluator
//! currently hits contention worth backing off (`RuleEngineError::Defer`).

pub mod backoff;
pub mod shard;
pub mod stop;
pub mod ticker;

pub use backoff::jittered_backoff;
pub use shard::ShardSpec;
pub use stop::GracefulStop;
pub use ticker::Ticker;
