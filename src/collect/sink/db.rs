//! Batched metadata DB sink.
//!
//! Accumulates processed records and lands each batch in one transaction:
//! distinct fingerprints via `INSERT IGNORE`, then distinct valid queries.
//! A failed batch is logged and discarded; the sink keeps consuming.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mysql_async::prelude::*;
use mysql_async::{Opts, Pool, TxOpts, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DbOutputConfig;
use crate::query::{is_valid_query, Query};

pub struct DbSink {
    cfg: DbOutputConfig,
    pool: Pool,
    inserted: Arc<AtomicU64>,
    lat_tx: mpsc::Sender<Duration>,
    lat_rx: Option<mpsc::Receiver<Duration>>,
}

impl DbSink {
    pub fn new(cfg: DbOutputConfig) -> Result<Self> {
        let opts = Opts::from_url(&cfg.dsn()).context("parsing corpus database DSN")?;
        let pool = Pool::new(opts);
        let (lat_tx, lat_rx) = mpsc::channel(100);

        Ok(Self {
            cfg,
            pool,
            inserted: Arc::new(AtomicU64::new(0)),
            lat_tx,
            lat_rx: Some(lat_rx),
        })
    }

    /// Consumes the processed-record channel until it closes or the run is
    /// cancelled. The final partial batch is always flushed.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut input: mpsc::Receiver<Query>,
    ) -> Result<()> {
        // Fail fast on an unreachable database.
        self.pool
            .get_conn()
            .await
            .context("connecting to corpus database")?;

        if self.cfg.truncate {
            info!("truncating corpus tables");
            self.truncate_tables()
                .await
                .context("truncating corpus tables")?;
        }

        let reporter_cancel = cancel.child_token();
        let lat_rx = self.lat_rx.take().expect("run called more than once");
        let reporter = tokio::spawn(insert_reporter(
            lat_rx,
            Arc::clone(&self.inserted),
            reporter_cancel.clone(),
        ));

        let mut batch: Vec<Query> = Vec::with_capacity(self.cfg.batch_size);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                record = input.recv() => {
                    let Some(record) = record else { break };
                    batch.push(record);
                    if batch.len() >= self.cfg.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        reporter_cancel.cancel();
        let _ = reporter.await;

        info!(
            inserted = self.inserted.load(Ordering::Relaxed),
            "db output completed",
        );

        self.pool
            .disconnect()
            .await
            .context("closing corpus database pool")?;

        Ok(())
    }

    /// Inserts the batch, logging failures; the batch is cleared either way.
    async fn flush(&self, batch: &mut Vec<Query>) {
        match self.insert_batch(batch).await {
            Ok(n) => {
                self.inserted.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, batch = batch.len(), "batch insert failed, dropping batch");
            }
        }
        batch.clear();
    }

    async fn insert_batch(&self, batch: &[Query]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get_conn().await.context("getting connection")?;
        // Rolls back automatically if the transaction is dropped uncommitted.
        let mut tx = conn
            .start_transaction(TxOpts::default())
            .await
            .context("starting transaction")?;

        let mut seen_fingerprints: HashSet<u64> = HashSet::with_capacity(batch.len());
        let mut fingerprint_rows = Vec::new();
        let mut fingerprint_params: Vec<Value> = Vec::new();

        for q in batch {
            if seen_fingerprints.insert(q.fingerprint_hash) {
                fingerprint_rows.push("(?, ?)");
                fingerprint_params.push(Value::Bytes(q.fingerprint.clone()));
                fingerprint_params.push(Value::UInt(q.fingerprint_hash));
            }
        }

        if !fingerprint_rows.is_empty() {
            let sql = format!(
                "INSERT IGNORE INTO QueryFingerprint (Fingerprint, Hash) VALUES {}",
                fingerprint_rows.join(", "),
            );
            self.timed_exec(&mut tx, &sql, fingerprint_params)
                .await
                .context("batch inserting fingerprints")?;
        }

        let mut seen_queries: HashSet<u64> = HashSet::with_capacity(batch.len());
        let mut query_rows = Vec::new();
        let mut query_params: Vec<Value> = Vec::new();

        for q in batch {
            let mut raw = q.raw.clone();
            if !is_valid_query(&mut raw) {
                continue;
            }
            if seen_queries.insert(q.hash) {
                query_rows.push("(?, ?, ?, ?)");
                query_params.push(Value::UInt(q.hash));
                query_params.push(Value::UInt(q.offset));
                query_params.push(Value::UInt(q.length));
                query_params.push(Value::UInt(q.fingerprint_hash));
            }
        }

        if query_rows.is_empty() {
            tx.commit().await.context("committing transaction")?;
            return Ok(0);
        }

        let sql = format!(
            "INSERT INTO Query (Hash, Offset, Length, FingerprintHash) VALUES {}",
            query_rows.join(", "),
        );
        self.timed_exec(&mut tx, &sql, query_params)
            .await
            .context("batch inserting queries")?;

        tx.commit().await.context("committing transaction")?;

        Ok(seen_queries.len())
    }

    async fn timed_exec(
        &self,
        tx: &mut mysql_async::Transaction<'_>,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<(), mysql_async::Error> {
        let start = Instant::now();
        let result = tx.exec_drop(sql, params).await;
        let _ = self.lat_tx.try_send(start.elapsed());
        result
    }

    /// Empties both corpus tables, toggling FK checks around the truncates.
    async fn truncate_tables(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;

        tx.query_drop("SET FOREIGN_KEY_CHECKS = 0").await?;
        tx.query_drop("TRUNCATE TABLE Query").await?;
        tx.query_drop("TRUNCATE TABLE QueryFingerprint").await?;
        tx.query_drop("SET FOREIGN_KEY_CHECKS = 1").await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Logs inserted-per-second and the average insert latency once a second.
async fn insert_reporter(
    mut lat_rx: mpsc::Receiver<Duration>,
    inserted: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut lats: Vec<Duration> = Vec::with_capacity(100);
    let mut last_count = inserted.load(Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(inserted = inserted.load(Ordering::Relaxed), "insert reporter stopped");
                return;
            }
            lat = lat_rx.recv() => {
                match lat {
                    Some(lat) => lats.push(lat),
                    None => return,
                }
            }
            _ = ticker.tick() => {
                if !lats.is_empty() {
                    let sum: Duration = lats.iter().sum();
                    let avg_ms = sum.as_millis() as u64 / lats.len() as u64;
                    info!(avg_insert_latency_ms = avg_ms, "insert latency");
                    lats.clear();
                }

                let count = inserted.load(Ordering::Relaxed);
                info!(inserted = count, per_second = count - last_count, "inserting");
                last_count = count;
            }
        }
    }
}
