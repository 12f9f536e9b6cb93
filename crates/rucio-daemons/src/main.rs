//! Binary wiring every long-running control-plane role to a `main`,
//! analogous to the teacher's `bridge-server` binary: one process runs
//! one role, shardable via `--process-index`/`--total-processes` and
//! `--thread-index`/`--total-threads` (spec.md §2 item 9, §5 "Sharding").

mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{debug, info};

use c3po::{Advisor, StaticPopularity};
use catalog::Store;
use conveyor::{Conveyor, NullMonitorSink, NullTransferTool, ReconcileConfig};
use daemon::{jittered_backoff, GracefulStop, ShardSpec, Ticker};
use rse_expr::Evaluator;
use rule_engine::{RuleEngine, RuleEngineError};
use transmogrifier::Supervisor;

use config::{Config, ConfigError};

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Rucio replication control-plane daemons", long_about = None)]
struct Args {
    /// Path to a TOML config file (spec.md §6 chunksize/maxdids/etc).
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite catalog path; defaults to an in-memory store if omitted.
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    process_index: u32,
    #[arg(long, default_value_t = 1)]
    total_processes: u32,
    #[arg(long, default_value_t = 0)]
    thread_index: u32,
    #[arg(long, default_value_t = 1)]
    total_threads: u32,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Re-evaluates rules and sweeps expired ones.
    RuleEvaluator,
    /// Submits `QUEUED` requests to the external transfer tool.
    Submitter,
    /// Polls outstanding transfers and reconciles terminal state.
    Poller,
    /// Finalizes terminated `TRANSFER` requests.
    Finisher,
    /// Finalizes terminated `STAGEIN`/`STAGEOUT` requests.
    Stager,
    /// Matches newly registered DIDs against active subscriptions.
    Transmogrifier,
    /// Decays the c3po self-cooling penalty table on a fixed tick.
    C3po,
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let db_path = args.db.as_deref().map(PathBuf::from).or_else(|| config.db_path.clone().map(PathBuf::from));

    let store = match &db_path {
        Some(path) => Store::open(path)?,
        None => Store::open_in_memory()?,
    };

    let shard = ShardSpec::new(args.process_index, args.total_processes, args.thread_index, args.total_threads);
    let stop = GracefulStop::new();
    spawn_ctrl_c_handler(stop.clone());

    match args.role {
        Role::RuleEvaluator => run_rule_evaluator(store, config, stop).await,
        Role::Submitter => run_submitter(store, config, shard, stop).await,
        Role::Poller => run_poller(store, config, shard, stop).await,
        Role::Finisher => run_finisher(store, config, shard, stop).await,
        Role::Stager => run_stager(store, config, shard, stop).await,
        Role::Transmogrifier => run_transmogrifier(store, config, stop).await,
        Role::C3po => run_c3po(store, stop).await,
    }
}

fn reconcile_config(config: &Config) -> ReconcileConfig {
    ReconcileConfig { retry_limit: config.retry_limit, submit_stuck_timeout_secs: config.submit_stuck_timeout_secs }
}

fn spawn_ctrl_c_handler(stop: GracefulStop) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("rucio-daemons: ctrl-c received, requesting graceful stop");
            stop.request_stop();
        }
    });
}

async fn run_rule_evaluator(store: Store, config: Config, stop: GracefulStop) -> Result<(), MainError> {
    let engine = RuleEngine::new(store, Evaluator::new());
    let backoff_base = std::time::Duration::from_secs(config.sleep_time_secs);
    let ticker = Ticker::new("rule-evaluator", backoff_base, stop);
    ticker
        .run(|| {
            let engine = engine.clone();
            async move {
                let expired = engine.sweep_expired().map_err(|e| e.to_string())?;
                if !expired.is_empty() {
                    info!("rule-evaluator: expired {} rule(s)", expired.len());
                }

                let pending = engine.rules_needing_reevaluation().map_err(|e| e.to_string())?;
                for rule_id in pending {
                    match engine.re_evaluate_rule(rule_id) {
                        Ok(()) => {}
                        Err(e @ RuleEngineError::Defer(_)) => {
                            debug!("rule-evaluator: {}, backing off", e);
                            tokio::time::sleep(jittered_backoff(backoff_base)).await;
                        }
                        Err(e) => return Err(e.to_string()),
                    }
                }
                Ok(())
            }
        })
        .await;
    Ok(())
}

async fn run_submitter(store: Store, config: Config, shard: ShardSpec, stop: GracefulStop) -> Result<(), MainError> {
    let conveyor = Conveyor::new(store, Box::new(NullTransferTool), Box::new(NullMonitorSink), reconcile_config(&config));
    let ticker = Ticker::new("submitter", std::time::Duration::from_secs(config.sleep_time_secs), stop);
    let external_host = config.external_host.clone();
    ticker
        .run(|| {
            let older_than = chrono::Utc::now();
            async {
                let n = conveyor.submit(&external_host, shard, older_than).map_err(|e| e.to_string())?;
                info!("submitter: submitted {} request(s)", n);
                Ok(())
            }
        })
        .await;
    Ok(())
}

async fn run_poller(store: Store, config: Config, shard: ShardSpec, stop: GracefulStop) -> Result<(), MainError> {
    let conveyor = Conveyor::new(store, Box::new(NullTransferTool), Box::new(NullMonitorSink), reconcile_config(&config));
    let ticker = Ticker::new("poller", std::time::Duration::from_secs(config.poll_interval_secs), stop);
    let external_host = config.external_host.clone();
    ticker
        .run(|| async {
            let n = conveyor.poll(&external_host, shard).map_err(|e| e.to_string())?;
            info!("poller: polled {} outcome(s)", n);
            Ok(())
        })
        .await;
    Ok(())
}

async fn run_finisher(store: Store, config: Config, shard: ShardSpec, stop: GracefulStop) -> Result<(), MainError> {
    let conveyor = Conveyor::new(store, Box::new(NullTransferTool), Box::new(NullMonitorSink), reconcile_config(&config));
    let ticker = Ticker::new("finisher", std::time::Duration::from_secs(30), stop);
    ticker
        .run(|| async {
            let n = conveyor.finish(shard).map_err(|e| e.to_string())?;
            info!("finisher: reconciled {} request(s)", n);
            Ok(())
        })
        .await;
    Ok(())
}

async fn run_stager(store: Store, config: Config, shard: ShardSpec, stop: GracefulStop) -> Result<(), MainError> {
    let conveyor = Conveyor::new(store, Box::new(NullTransferTool), Box::new(NullMonitorSink), reconcile_config(&config));
    let ticker = Ticker::new("stager", std::time::Duration::from_secs(30), stop);
    ticker
        .run(|| async {
            let n = conveyor.stage(shard).map_err(|e| e.to_string())?;
            info!("stager: reconciled {} request(s)", n);
            Ok(())
        })
        .await;
    Ok(())
}

async fn run_transmogrifier(store: Store, config: Config, stop: GracefulStop) -> Result<(), MainError> {
    let engine = RuleEngine::new(store.clone(), Evaluator::new());
    let supervisor = Supervisor::new(
        store,
        engine,
        transmogrifier::Config { chunksize: config.chunksize, maxdids: config.maxdids, worker_count: 4, max_resubmissions: 1 },
    );
    let ticker = Ticker::new("transmogrifier", std::time::Duration::from_secs(config.sleep_time_secs), stop);
    ticker
        .run(|| async {
            let stats = supervisor.run_once().await.map_err(|e| e.to_string())?;
            info!("transmogrifier: {}/{} dids processed", stats.completed, stats.dispatched);
            Ok(())
        })
        .await;
    Ok(())
}

async fn run_c3po(store: Store, stop: GracefulStop) -> Result<(), MainError> {
    let advisor = Advisor::new(store, c3po::Config::default(), StaticPopularity::new());
    let ticker = Ticker::new("c3po", std::time::Duration::from_secs(60), stop);
    ticker
        .run(|| async {
            advisor.tick();
            Ok(())
        })
        .await;
    Ok(())
}
