//! Per-interval statistics aggregation and snapshot broadcasting.
//!
//! The reporter consumes [`QueryResult`]s, folds them into a five-second
//! aggregation window (latency percentiles, QPS, error distribution), keeps
//! a bounded history of past windows, and broadcasts a sanitized JSON
//! snapshot to every connected WebSocket client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::replay::querier::{QuerierPerfStats, QueryResult};
use crate::replay::server::ReplayMetrics;
use crate::replay::source::{QuerySource, SourcePerfStats};

/// Latency samples kept per aggregation window.
pub const MAX_RES: usize = 1_000_000;

/// Aggregation windows kept in history.
pub const MAX_AGGREGATES_HISTORY: usize = 100;

/// Aggregation interval.
pub const AGGREGATE_INTERVAL: Duration = Duration::from_secs(5);

/// Internal component statistics carried in each snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InternalStats {
    pub queries_fetched: i64,
    pub cache_hits: i64,
    pub cache_misses: i64,
    pub cache_hit_rate: f64,
    pub cache_evictions: i64,
    pub cache_new_items: i64,
    pub fetch_weights_lat: String,

    pub lats: Vec<f64>,
    pub lat_p50: String,
    pub lat_p95: String,
    pub lat_p99: String,
}

/// One closed aggregation window.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStat {
    pub fastest: f64,
    pub slowest: f64,
    pub average: f64,
    pub qps: f64,
    #[serde(rename = "query_latency_p50")]
    pub lat_p50: f64,
    #[serde(rename = "query_latency_p95")]
    pub lat_p95: f64,
    #[serde(rename = "query_latency_p99")]
    pub lat_p99: f64,
    pub num_res: i64,
}

/// The broadcast payload. All floats are finite after sanitization.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub internal_stats: InternalStats,
    pub lats: Vec<f64>,
    /// Nanoseconds since the run started.
    pub total: i64,
    pub start_at: String,
    pub num_res: i64,
    pub active_connections: usize,
    pub avg_total: f64,
    pub aggregates: Vec<AggregateStat>,
    pub error_dist: HashMap<String, u64>,
}

pub struct Reporter {
    /// Start of the current aggregation window.
    window_start: Instant,
    run_start: Instant,
    started_at: DateTime<Utc>,

    /// Successful-execution latencies (microseconds) this window.
    lats: Vec<f64>,
    avg_total: f64,
    num_res: i64,
    error_dist: HashMap<String, u64>,
    aggregates: Vec<AggregateStat>,

    active_connections: usize,
    snapshot_tx: broadcast::Sender<String>,
    metrics: Option<std::sync::Arc<ReplayMetrics>>,
}

impl Reporter {
    pub fn new(
        active_connections: usize,
        snapshot_tx: broadcast::Sender<String>,
        metrics: Option<std::sync::Arc<ReplayMetrics>>,
    ) -> Self {
        Self {
            window_start: Instant::now(),
            run_start: Instant::now(),
            started_at: Utc::now(),
            lats: Vec::new(),
            avg_total: 0.0,
            num_res: 0,
            error_dist: HashMap::new(),
            aggregates: Vec::new(),
            active_connections,
            snapshot_tx,
            metrics,
        }
    }

    /// Consumes results until the channel closes or cancellation; a final
    /// aggregate-and-broadcast runs on the way out.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut results: mpsc::Receiver<QueryResult>,
        source: std::sync::Arc<QuerySource>,
        perf: std::sync::Arc<QuerierPerfStats>,
    ) {
        let mut ticker = tokio::time::interval(AGGREGATE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Intervals fire immediately once; consume that tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.tick(&source, &perf);
                    return;
                }
                result = results.recv() => {
                    match result {
                        Some(result) => self.on_result(result),
                        None => {
                            self.tick(&source, &perf);
                            return;
                        }
                    }
                }
                _ = ticker.tick() => self.tick(&source, &perf),
            }
        }
    }

    /// Folds one result into the current window.
    fn on_result(&mut self, result: QueryResult) {
        self.num_res += 1;

        if let Some(metrics) = &self.metrics {
            metrics.queries_executed.inc();
        }

        match result.err {
            Some(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.query_errors.inc();
                }
                *self.error_dist.entry(err.to_string()).or_insert(0) += 1;
            }
            None => {
                let micros = result.exec_latency.as_micros() as f64;
                self.avg_total += micros;
                if self.lats.len() < MAX_RES {
                    self.lats.push(micros);
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .exec_latency
                        .observe(result.exec_latency.as_secs_f64());
                }
            }
        }
    }

    /// Closes the window, refreshes internal stats, and broadcasts.
    fn tick(&mut self, source: &QuerySource, perf: &QuerierPerfStats) {
        let source_stats = source.perf_stats();
        let mut fetch_lats = perf.fetch_lats();
        let internal = build_internal_stats(&source_stats, &mut fetch_lats);

        if let Some(metrics) = &self.metrics {
            metrics.update_from_source(&source_stats);
        }

        self.aggregate();

        let mut snapshot = self.snapshot(internal);
        let changed = sanitize_snapshot(&mut snapshot);
        if changed {
            warn!("sanitized non-finite float values in stats snapshot");
        }

        if let Some(last) = snapshot.aggregates.last() {
            info!(
                qps = last.qps,
                avg_us = last.average,
                p50_us = last.lat_p50,
                p95_us = last.lat_p95,
                p99_us = last.lat_p99,
                num_res = last.num_res,
                "aggregated window",
            );
        }

        match serde_json::to_string(&snapshot) {
            // No receivers is fine; send only fails when nobody listens.
            Ok(json) => {
                let _ = self.snapshot_tx.send(json);
            }
            Err(e) => warn!(error = %e, "failed to serialize stats snapshot"),
        }
    }

    /// Closes the current window into the aggregate history.
    fn aggregate(&mut self) {
        if self.lats.is_empty() {
            return;
        }

        let elapsed = self.window_start.elapsed();
        self.lats
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = self.lats.len();

        let aggregate = AggregateStat {
            qps: self.num_res as f64 / elapsed.as_secs_f64(),
            average: self.avg_total / n as f64,
            num_res: self.num_res,
            fastest: self.lats[0],
            slowest: self.lats[n - 1],
            lat_p50: percentile(&self.lats, 50),
            lat_p95: percentile(&self.lats, 95),
            lat_p99: percentile(&self.lats, 99),
        };
        self.insert_aggregate(aggregate);

        self.window_start = Instant::now();
        self.avg_total = 0.0;
        self.lats.clear();
        self.num_res = 0;
    }

    fn insert_aggregate(&mut self, aggregate: AggregateStat) {
        if self.aggregates.len() >= MAX_AGGREGATES_HISTORY {
            self.aggregates.remove(0);
        }
        self.aggregates.push(aggregate);
    }

    fn snapshot(&self, internal_stats: InternalStats) -> Snapshot {
        Snapshot {
            internal_stats,
            lats: self.lats.clone(),
            total: self.run_start.elapsed().as_nanos() as i64,
            start_at: self.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            num_res: self.num_res,
            active_connections: self.active_connections,
            avg_total: self.avg_total,
            aggregates: self.aggregates.clone(),
            error_dist: self.error_dist.clone(),
        }
    }
}

/// Index-based percentile on a sorted slice: the `floor(n*p/100)`-th value.
pub fn percentile(sorted: &[f64], p: usize) -> f64 {
    sorted[sorted.len() * p / 100]
}

fn format_ms(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

fn build_internal_stats(source: &SourcePerfStats, fetch_lats: &mut [Duration]) -> InternalStats {
    let (p50, p95, p99) = if fetch_lats.is_empty() {
        (Duration::ZERO, Duration::ZERO, Duration::ZERO)
    } else {
        fetch_lats.sort_unstable();
        let n = fetch_lats.len();
        (
            fetch_lats[n * 50 / 100],
            fetch_lats[n * 95 / 100],
            fetch_lats[n * 99 / 100],
        )
    };

    let lookups = source.cache.hits_total + source.cache.misses_total;

    InternalStats {
        queries_fetched: source.queries_fetch_total as i64,
        cache_hits: source.cache.hits_total as i64,
        cache_misses: source.cache.misses_total as i64,
        // 0/0 yields NaN here; sanitization resolves it before broadcast.
        cache_hit_rate: source.cache.hits_total as f64 / lookups as f64 * 100.0,
        cache_evictions: source.cache.evictions_total as i64,
        cache_new_items: source.cache.new_items_total as i64,
        fetch_weights_lat: format_ms(source.fetch_weights_lat),
        lats: Vec::new(),
        lat_p50: format_ms(p50),
        lat_p95: format_ms(p95),
        lat_p99: format_ms(p99),
    }
}

fn fix(value: &mut f64, changed: &mut bool) {
    if !value.is_finite() {
        *value = 0.0;
        *changed = true;
    }
}

/// Replaces every NaN or infinite float with 0 so the JSON encoder never
/// sees a non-finite value. Returns whether anything was rewritten.
fn sanitize_snapshot(snapshot: &mut Snapshot) -> bool {
    let mut changed = false;

    fix(&mut snapshot.internal_stats.cache_hit_rate, &mut changed);
    for v in &mut snapshot.internal_stats.lats {
        fix(v, &mut changed);
    }
    for v in &mut snapshot.lats {
        fix(v, &mut changed);
    }
    fix(&mut snapshot.avg_total, &mut changed);

    for aggregate in &mut snapshot.aggregates {
        fix(&mut aggregate.fastest, &mut changed);
        fix(&mut aggregate.slowest, &mut changed);
        fix(&mut aggregate.average, &mut changed);
        fix(&mut aggregate.qps, &mut changed);
        fix(&mut aggregate.lat_p50, &mut changed);
        fix(&mut aggregate.lat_p95, &mut changed);
        fix(&mut aggregate.lat_p99, &mut changed);
    }

    changed
}
