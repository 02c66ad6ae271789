//! Replay engine orchestration: source → querier workers → reporter.
//!
//! The orchestrator owns every lifecycle: it initializes the query source,
//! opens the target pool, starts the optional metrics server, spawns the
//! worker fleet and the reporter, and tears everything down only after the
//! last worker has exited.

pub mod querier;
pub mod reporter;
pub mod server;
pub mod source;
pub mod weights;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ReplayConfig;
use crate::dbpool::DbPool;

use self::querier::{QpsGate, Querier, QuerierPerfStats};
use self::reporter::Reporter;
use self::server::MetricsServer;
use self::source::QuerySource;

/// Wall-clock limit on the target DB connect+ping.
const DB_OPEN_DEADLINE: Duration = Duration::from_secs(30);

/// Runs the load test to completion (count budget spent), cancellation, or
/// a fatal failure.
pub async fn run(cfg: ReplayConfig, cancel: CancellationToken) -> Result<()> {
    let source = Arc::new(QuerySource::from_config(&cfg).context("creating query data source")?);

    info!(source = source.name(), "initializing query data source");
    source
        .init()
        .await
        .context("initializing query data source")?;
    info!("query data source ready");

    let server = if cfg.metrics.enabled {
        let server = MetricsServer::new(&cfg.metrics.addr)?;
        server.start().await.context("starting metrics server")?;
        info!(
            addr = %cfg.metrics.addr,
            "metrics server started, dashboard at http://{}", cfg.metrics.addr,
        );
        Some(server)
    } else {
        None
    };

    let (snapshot_tx, metrics) = match &server {
        Some(server) => (server.snapshot_sender(), Some(server.metrics())),
        // Broadcasting without a server just drops the snapshots.
        None => (tokio::sync::broadcast::channel(16).0, None),
    };

    let db = Arc::new(DbPool::new(
        cfg.db_dsn.clone(),
        cfg.concurrency,
        cfg.retry.clone(),
    ));
    info!("opening connection to target database");
    db.open(Some(DB_OPEN_DEADLINE))
        .await
        .context("opening target database")?;
    info!("connection to target database opened");

    let gate = (cfg.qps > 0).then(|| QpsGate::start(cfg.qps, cancel.clone()));
    if let Some(qps) = (cfg.qps > 0).then_some(cfg.qps) {
        info!(qps, "qps gating enabled");
    }

    let (results_tx, results_rx) = mpsc::channel(cfg.concurrency * 100);
    let perf = Arc::new(QuerierPerfStats::new());
    let querier = Arc::new(Querier::new(
        Arc::clone(&source),
        Arc::clone(&db),
        cfg.run_mode,
        results_tx,
        Arc::clone(&perf),
    ));

    let reporter = Reporter::new(cfg.concurrency, snapshot_tx, metrics);
    let reporter_handle = tokio::spawn(reporter.run(
        cancel.clone(),
        results_rx,
        Arc::clone(&source),
        Arc::clone(&perf),
    ));

    let executed = Arc::new(AtomicU64::new(0));
    let mut workers = tokio::task::JoinSet::new();

    for worker_id in 0..cfg.concurrency {
        let querier = Arc::clone(&querier);
        let cancel = cancel.clone();
        let gate = gate.clone();
        let executed = Arc::clone(&executed);
        let count = cfg.count;

        workers.spawn(async move {
            info!(worker_id, "starting querier worker");
            querier.run_worker(cancel, gate, executed, count).await
        });
    }

    let mut cause: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        match joined.context("querier worker panicked")? {
            Ok(()) => {}
            Err(e) => {
                error!(error = format!("{e:#}"), "querier worker failed");
                if cause.is_none() {
                    cause = Some(e.context("querier worker failed"));
                }
                cancel.cancel();
            }
        }
    }

    // Dropping the querier closes the results channel; the reporter runs a
    // final aggregation pass and exits.
    drop(querier);
    let _ = reporter_handle.await;

    if let Some(server) = &server {
        server.stop().await;
    }
    db.close().await;
    source.destroy().await;

    info!("load test finished");

    match cause {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
