//! Live metrics server: dashboard page, WebSocket snapshot stream, and
//! Prometheus exposition.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::replay::source::SourcePerfStats;

/// Prometheus metrics for the replay run.
pub struct ReplayMetrics {
    registry: Registry,

    /// Total queries executed against the target.
    pub queries_executed: Counter,
    /// Total failed query executions.
    pub query_errors: Counter,
    /// Query execution latency.
    pub exec_latency: Histogram,

    /// Total queries fetched from the data source.
    pub source_queries_fetched: Gauge,
    /// Data source cache hits.
    pub source_cache_hits: Gauge,
    /// Data source cache misses.
    pub source_cache_misses: Gauge,
}

impl ReplayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_executed = Counter::with_opts(
            Opts::new("queries_executed_total", "Total queries executed.")
                .namespace("queryreplay"),
        )?;
        let query_errors = Counter::with_opts(
            Opts::new("query_errors_total", "Total failed query executions.")
                .namespace("queryreplay"),
        )?;
        let exec_latency = Histogram::with_opts(
            HistogramOpts::new("query_exec_latency_seconds", "Query execution latency.")
                .namespace("queryreplay")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let source_queries_fetched = Gauge::with_opts(
            Opts::new(
                "source_queries_fetched_total",
                "Total queries fetched from the data source.",
            )
            .namespace("queryreplay"),
        )?;
        let source_cache_hits = Gauge::with_opts(
            Opts::new("source_cache_hits_total", "Data source cache hits.")
                .namespace("queryreplay"),
        )?;
        let source_cache_misses = Gauge::with_opts(
            Opts::new("source_cache_misses_total", "Data source cache misses.")
                .namespace("queryreplay"),
        )?;

        registry.register(Box::new(queries_executed.clone()))?;
        registry.register(Box::new(query_errors.clone()))?;
        registry.register(Box::new(exec_latency.clone()))?;
        registry.register(Box::new(source_queries_fetched.clone()))?;
        registry.register(Box::new(source_cache_hits.clone()))?;
        registry.register(Box::new(source_cache_misses.clone()))?;

        Ok(Self {
            registry,
            queries_executed,
            query_errors,
            exec_latency,
            source_queries_fetched,
            source_cache_hits,
            source_cache_misses,
        })
    }

    /// Mirrors source counters into gauges on each reporter tick.
    pub fn update_from_source(&self, stats: &SourcePerfStats) {
        self.source_queries_fetched
            .set(stats.queries_fetch_total as f64);
        self.source_cache_hits.set(stats.cache.hits_total as f64);
        self.source_cache_misses
            .set(stats.cache.misses_total as f64);
    }
}

struct AppState {
    registry: Registry,
    snapshot_tx: tokio::sync::broadcast::Sender<String>,
}

/// HTTP server exposing `/` (dashboard), `/ws`, and `/metrics`.
pub struct MetricsServer {
    addr: String,
    metrics: Arc<ReplayMetrics>,
    snapshot_tx: tokio::sync::broadcast::Sender<String>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl MetricsServer {
    pub fn new(addr: &str) -> Result<Self> {
        let (snapshot_tx, _) = tokio::sync::broadcast::channel(16);

        Ok(Self {
            addr: addr.to_string(),
            metrics: Arc::new(ReplayMetrics::new().context("creating replay metrics")?),
            snapshot_tx,
            shutdown: parking_lot::Mutex::new(None),
        })
    }

    pub fn metrics(&self) -> Arc<ReplayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Sender the reporter broadcasts sanitized snapshots into.
    pub fn snapshot_sender(&self) -> tokio::sync::broadcast::Sender<String> {
        self.snapshot_tx.clone()
    }

    /// Binds and starts serving; returns once the listener is up.
    pub async fn start(&self) -> Result<()> {
        // Handle ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let state = Arc::new(AppState {
            registry: self.metrics.registry.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
        });

        let app = Router::new()
            .route("/", get(index_handler))
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts the server down.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET / - live dashboard.
async fn index_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

/// GET /ws - snapshot stream.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

/// Forwards broadcast snapshots to one client until either side drops.
async fn client_loop(mut socket: WebSocket, state: Arc<AppState>) {
    let mut snapshots = state.snapshot_tx.subscribe();
    debug!("websocket client connected");

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                match snapshot {
                    Ok(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // A slow client skips missed snapshots and catches up.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    debug!("websocket client disconnected");
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>queryreplay</title>
<style>
  body { font-family: ui-monospace, monospace; margin: 2rem; background: #101418; color: #d8dee9; }
  h1 { font-size: 1.2rem; }
  .grid { display: grid; grid-template-columns: repeat(4, minmax(10rem, 1fr)); gap: 1rem; }
  .card { background: #1b2128; border-radius: 6px; padding: 1rem; }
  .card .label { font-size: 0.75rem; color: #7f8ea3; text-transform: uppercase; }
  .card .value { font-size: 1.4rem; margin-top: 0.25rem; }
  #errors { margin-top: 1.5rem; white-space: pre-wrap; color: #e06c75; }
</style>
</head>
<body>
<h1>queryreplay load test</h1>
<div class="grid">
  <div class="card"><div class="label">qps</div><div class="value" id="qps">-</div></div>
  <div class="card"><div class="label">p50 (us)</div><div class="value" id="p50">-</div></div>
  <div class="card"><div class="label">p95 (us)</div><div class="value" id="p95">-</div></div>
  <div class="card"><div class="label">p99 (us)</div><div class="value" id="p99">-</div></div>
  <div class="card"><div class="label">results</div><div class="value" id="num_res">-</div></div>
  <div class="card"><div class="label">cache hit rate</div><div class="value" id="hit_rate">-</div></div>
  <div class="card"><div class="label">connections</div><div class="value" id="conns">-</div></div>
  <div class="card"><div class="label">fetched</div><div class="value" id="fetched">-</div></div>
</div>
<div id="errors"></div>
<script>
  const ws = new WebSocket(`ws://${location.host}/ws`);
  const set = (id, v) => document.getElementById(id).textContent = v;
  ws.onmessage = (event) => {
    const s = JSON.parse(event.data);
    const agg = s.aggregates[s.aggregates.length - 1];
    if (agg) {
      set('qps', agg.qps.toFixed(1));
      set('p50', agg.query_latency_p50.toFixed(0));
      set('p95', agg.query_latency_p95.toFixed(0));
      set('p99', agg.query_latency_p99.toFixed(0));
      set('num_res', agg.num_res);
    }
    set('hit_rate', s.internal_stats.cache_hit_rate.toFixed(1) + '%');
    set('conns', s.active_connections);
    set('fetched', s.internal_stats.queries_fetched);
    const errs = Object.entries(s.error_dist || {});
    document.getElementById('errors').textContent =
      errs.map(([msg, n]) => `${n}x ${msg}`).join('\n');
  };
</script>
</body>
</html>
"#;
