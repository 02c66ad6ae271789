//! Query execution workers and rate control.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RunMode;
use crate::dbpool::DbPool;
use crate::replay::source::QuerySource;
use crate::ring::RingBuffer;

/// Capacity of the source-fetch latency history.
const MAX_FETCH_LATS: usize = 5000 * 8;

/// Log one source/sampling error out of this many.
const ERROR_LOG_SAMPLE: u64 = 1000;

/// Outcome of one executed query, consumed by the reporter.
#[derive(Debug)]
pub struct QueryResult {
    pub completion_timestamp: SystemTime,
    /// Reserved for EXPLAIN-measuring runs; plain replay leaves it unset.
    pub explain_latency: Option<Duration>,
    pub exec_latency: Duration,
    pub err: Option<QuerierError>,
}

/// Execution failure with enough context to group by message.
#[derive(Debug)]
pub struct QuerierError {
    pub query: String,
    pub fingerprint: String,
    pub message: String,
}

impl fmt::Display for QuerierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error executing query {:?} with fingerprint {:?}: {}",
            self.query, self.fingerprint, self.message,
        )
    }
}

/// Source-fetch latency history shared by all workers.
pub struct QuerierPerfStats {
    fetch_lats: RingBuffer<Duration>,
}

impl QuerierPerfStats {
    pub fn new() -> Self {
        Self {
            fetch_lats: RingBuffer::new(MAX_FETCH_LATS),
        }
    }

    pub fn record_fetch_lat(&self, lat: Duration) {
        self.fetch_lats.append(lat);
    }

    /// Recent fetch latencies, most recent first.
    pub fn fetch_lats(&self) -> Vec<Duration> {
        let mut out = Vec::with_capacity(self.fetch_lats.count());
        self.fetch_lats.get_all(&mut out);
        out
    }

    pub fn total_queries(&self) -> usize {
        self.fetch_lats.count()
    }
}

impl Default for QuerierPerfStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared QPS token source: one interval task feeds a depth-1 channel and
/// workers pull from it, so the budget is global across the pool.
pub struct QpsGate {
    tokens: Mutex<mpsc::Receiver<()>>,
}

impl QpsGate {
    /// Spawns the token task. `qps` must be positive.
    pub fn start(qps: u32, cancel: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let period = Duration::from_secs(1) / qps.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if tx.send(()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            tokens: Mutex::new(rx),
        })
    }

    /// Blocks until a token is available. `false` means the gate is closed.
    pub async fn acquire(&self) -> bool {
        self.tokens.lock().await.recv().await.is_some()
    }
}

/// Pulls queries from the source and executes them against the target.
///
/// The querier owns neither lifecycle: the orchestrator initializes the
/// source and opens the pool before workers start, and tears both down
/// after they exit.
pub struct Querier {
    source: Arc<QuerySource>,
    db: Arc<DbPool>,
    run_mode: RunMode,
    results: mpsc::Sender<QueryResult>,
    perf: Arc<QuerierPerfStats>,
    errors_seen: AtomicU64,
}

impl Querier {
    pub fn new(
        source: Arc<QuerySource>,
        db: Arc<DbPool>,
        run_mode: RunMode,
        results: mpsc::Sender<QueryResult>,
        perf: Arc<QuerierPerfStats>,
    ) -> Self {
        Self {
            source,
            db,
            run_mode,
            results,
            perf,
            errors_seen: AtomicU64::new(0),
        }
    }

    pub fn perf_stats(&self) -> &QuerierPerfStats {
        &self.perf
    }

    /// Worker loop: tick (when gated), sample, execute, report.
    ///
    /// `executed` is shared across workers; with a nonzero `count` budget
    /// the worker stops once the budget is spent.
    pub async fn run_worker(
        &self,
        cancel: CancellationToken,
        gate: Option<Arc<QpsGate>>,
        executed: Arc<AtomicU64>,
        count: u64,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if let Some(gate) = &gate {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    got = gate.acquire() => {
                        if !got {
                            return Ok(());
                        }
                    }
                }
            }

            if count > 0 && executed.fetch_add(1, Ordering::Relaxed) >= count {
                return Ok(());
            }

            if let Err(e) = self.execute_one(&cancel).await {
                // Sampled logging: per-record failures must not swamp the run.
                if self.errors_seen.fetch_add(1, Ordering::Relaxed) % ERROR_LOG_SAMPLE == 0 {
                    debug!(error = format!("{e:#}"), "query execution error");
                }
            }
        }
    }

    async fn execute_one(&self, cancel: &CancellationToken) -> Result<()> {
        let fetch_start = Instant::now();
        let hit = match self.run_mode {
            RunMode::Random => self
                .source
                .get_random_weighted_query()
                .await
                .context("getting random weighted query")?,
            RunMode::Sequential => self
                .source
                .get_sequential_query()
                .context("getting sequential query")?,
        };
        self.perf.record_fetch_lat(fetch_start.elapsed());

        let exec_start = Instant::now();
        let exec_err = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.db.exec_text(&hit.query) => result.err(),
        };
        let exec_latency = exec_start.elapsed();

        let result = QueryResult {
            completion_timestamp: SystemTime::now(),
            explain_latency: None,
            exec_latency,
            err: exec_err.map(|e| QuerierError {
                query: hit.query.clone(),
                fingerprint: hit.fingerprint.clone(),
                message: e.to_string(),
            }),
        };

        // A closed results channel means the reporter is gone; drop quietly.
        let _ = self.results.send(result).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_stats_ring_keeps_most_recent_first() {
        let perf = QuerierPerfStats::new();
        perf.record_fetch_lat(Duration::from_micros(1));
        perf.record_fetch_lat(Duration::from_micros(2));
        perf.record_fetch_lat(Duration::from_micros(3));

        let lats = perf.fetch_lats();
        assert_eq!(lats[0], Duration::from_micros(3));
        assert_eq!(lats[2], Duration::from_micros(1));
        assert_eq!(perf.total_queries(), 3);
    }

    #[test]
    fn test_querier_error_display() {
        let err = QuerierError {
            query: "select 1".to_string(),
            fingerprint: "select ?".to_string(),
            message: "deadlock found".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("select 1"));
        assert!(text.contains("deadlock found"));
    }

    #[tokio::test]
    async fn test_qps_gate_paces_tokens() {
        let cancel = CancellationToken::new();
        let gate = QpsGate::start(1000, cancel.clone());

        // Tokens flow while the gate is open.
        assert!(gate.acquire().await);
        assert!(gate.acquire().await);

        cancel.cancel();
        // After cancellation the channel drains and closes.
        loop {
            if !gate.acquire().await {
                break;
            }
        }
    }
}
