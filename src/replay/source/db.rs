//! DB-backed replay source.
//!
//! Weights and query-id lists come from the metadata database; each sampled
//! id resolves to an `(offset, length)` row via a templated fetch query, and
//! the query text itself is read from a memory map of the original capture
//! (one `<timestamp>\t<sql>` line per record).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use mysql_async::Row;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::OnceCell;
use tracing::info;

use crate::cache::{LruCache, LruCacheStats};
use crate::config::{DbSourceConfig, RetryConfig};
use crate::dbpool::DbPool;
use crate::replay::weights::{FingerprintData, FingerprintWeights};

use super::{render_template, slice_checked, QueryHit, SourcePerfStats};

/// Fixed per-fingerprint cache capacity for the DB-backed variant.
const QUERY_CACHE_CAPACITY: usize = 1000;

/// Wall-clock limit on the metadata DB connect+ping.
const OPEN_DEADLINE: Duration = Duration::from_secs(30);

struct DbState {
    pool: DbPool,
    mmap: Mmap,
    weights: FingerprintWeights,
    /// fingerprint hash → query ids in the metadata table.
    query_ids: HashMap<u64, Vec<i64>>,
    fetch_weights_lat: Duration,
    fetch_ids_lat: Duration,
    init_lat: Duration,
}

pub struct DbSource {
    cfg: DbSourceConfig,
    concurrency: usize,
    retry: RetryConfig,
    /// Latch caching the first init outcome, success or error.
    state: OnceCell<Result<Arc<DbState>, String>>,
    caches: RwLock<HashMap<u64, Arc<LruCache<i64, Arc<QueryHit>>>>>,
    fetch_total: AtomicU64,
}

impl DbSource {
    pub fn new(cfg: DbSourceConfig, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            cfg,
            concurrency,
            retry,
            state: OnceCell::new(),
            caches: RwLock::new(HashMap::new()),
            fetch_total: AtomicU64::new(0),
        }
    }

    /// Maps the capture, opens the pool, and loads weights and id lists.
    pub async fn init(&self) -> Result<()> {
        let outcome = self
            .state
            .get_or_init(|| async {
                match self.load().await {
                    Ok(state) => Ok(Arc::new(state)),
                    Err(e) => Err(format!("{e:#}")),
                }
            })
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!("{e}")),
        }
    }

    async fn load(&self) -> Result<DbState> {
        let start = Instant::now();

        info!(file = %self.cfg.input_file, "memory-mapping the capture file");
        let file = std::fs::File::open(&self.cfg.input_file)
            .with_context(|| format!("opening {}", self.cfg.input_file))?;
        // Safety: the capture file is read-only for the process lifetime.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("memory-mapping {}", self.cfg.input_file))?;

        info!("opening metadata database connection");
        let pool = DbPool::new(self.cfg.dsn.clone(), self.concurrency, self.retry.clone());
        pool.open(Some(OPEN_DEADLINE))
            .await
            .context("opening metadata database")?;

        info!("fetching fingerprint weights");
        let weights_start = Instant::now();
        let weights = fetch_weights(&pool, &self.cfg.fingerprint_weights_query)
            .await
            .context("fetching weights")?;
        let fetch_weights_lat = weights_start.elapsed();

        info!("fetching query ids");
        let ids_start = Instant::now();
        let query_ids = fetch_query_ids(&pool, &self.cfg.queries_ids_fetch_query)
            .await
            .context("fetching query ids")?;
        let fetch_ids_lat = ids_start.elapsed();

        let init_lat = start.elapsed();
        info!(
            fingerprints = weights.len(),
            ids = query_ids.values().map(Vec::len).sum::<usize>(),
            elapsed = ?init_lat,
            "db query source ready",
        );

        Ok(DbState {
            pool,
            mmap,
            weights,
            query_ids,
            fetch_weights_lat,
            fetch_ids_lat,
            init_lat,
        })
    }

    fn state(&self) -> Result<Arc<DbState>> {
        match self.state.get() {
            Some(Ok(state)) => Ok(Arc::clone(state)),
            Some(Err(e)) => Err(anyhow!("{e}")),
            None => bail!("query source is not initialized"),
        }
    }

    pub async fn get_random_weighted_query(&self) -> Result<Arc<QueryHit>> {
        let state = self.state()?;

        let fingerprint: FingerprintData = {
            let mut rng = rand::thread_rng();
            state
                .weights
                .sample(&mut rng)
                .cloned()
                .context("failed to get a random weighted fingerprint")?
        };

        let ids = state
            .query_ids
            .get(&fingerprint.hash)
            .filter(|ids| !ids.is_empty())
            .with_context(|| {
                format!("no query ids found for fingerprint hash {}", fingerprint.hash)
            })?;

        let id = ids[rand::thread_rng().gen_range(0..ids.len())];

        let cache = { self.caches.read().get(&fingerprint.hash).cloned() };
        if let Some(cache) = &cache {
            if let Some(hit) = cache.get(&id) {
                self.fetch_total.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }

        let hit = Arc::new(self.fetch_hit(&state, fingerprint.hash, id).await?);

        let cache = match cache {
            Some(cache) => cache,
            None => {
                let mut caches = self.caches.write();
                Arc::clone(
                    caches
                        .entry(fingerprint.hash)
                        .or_insert_with(|| Arc::new(LruCache::new(QUERY_CACHE_CAPACITY))),
                )
            }
        };
        cache.set(id, Arc::clone(&hit));

        self.fetch_total.fetch_add(1, Ordering::Relaxed);
        Ok(hit)
    }

    /// Resolves `(offset, length)` from the metadata table, then reads and
    /// splits the capture line.
    async fn fetch_hit(&self, state: &DbState, hash: u64, id: i64) -> Result<QueryHit> {
        let sql = render_template(&self.cfg.queries_fetch_query, id, hash);

        let row: Option<(u64, u64)> = state
            .pool
            .query_first_row(&sql)
            .await
            .with_context(|| format!("executing fetch query for id {id}"))?;
        let (offset, length) = row.with_context(|| format!("no metadata row for id {id}"))?;

        let line = slice_checked(&state.mmap, offset, length)?;
        parse_capture_line(line, offset)
    }

    pub fn perf_stats(&self) -> SourcePerfStats {
        let mut cache_stats = LruCacheStats::default();
        for cache in self.caches.read().values() {
            cache_stats.merge(&cache.stats());
        }

        let mut stats = SourcePerfStats {
            queries_fetch_total: self.fetch_total.load(Ordering::Relaxed),
            cache: cache_stats,
            ..Default::default()
        };

        if let Some(Ok(state)) = self.state.get() {
            stats.fetch_weights_lat = state.fetch_weights_lat;
            stats.fetch_ids_lat = state.fetch_ids_lat;
            stats.init_lat = state.init_lat;
            stats.queries_loaded = state.query_ids.values().map(Vec::len).sum();
            stats.unique_fingerprints = state.query_ids.len();
        }

        stats
    }

    pub async fn destroy(&self) {
        if let Some(Ok(state)) = self.state.get() {
            state.pool.close().await;
        }
    }
}

async fn fetch_weights(pool: &DbPool, sql: &str) -> Result<FingerprintWeights> {
    let rows: Vec<Row> = pool.query_rows(sql).await?;

    let mut weights = FingerprintWeights::new();
    for row in &rows {
        let (hash, count, weight) = parse_weights_row(row)?;
        weights.add(
            weight,
            FingerprintData {
                hash,
                freq_total: count,
            },
        );
    }

    if weights.total_weight() <= 0.0 {
        bail!(
            "no query weights were loaded from the database, \
             ensure the QueryFingerprint table is populated"
        );
    }

    Ok(weights)
}

/// Accepts `(Hash, Count, Total, Weight)` or
/// `(Fingerprint, Hash, Count, Total, Weight)` rows.
fn parse_weights_row(row: &Row) -> Result<(u64, i64, f64)> {
    let base = match row.len() {
        4 => 0,
        5 => 1,
        n => bail!("weights query returned {n} columns, expected 4 or 5"),
    };

    let hash: u64 = column(row, base, "Hash")?;
    let count: i64 = column(row, base + 1, "Count")?;
    let weight: f64 = column(row, base + 3, "Weight")?;

    Ok((hash, count, weight))
}

async fn fetch_query_ids(pool: &DbPool, sql: &str) -> Result<HashMap<u64, Vec<i64>>> {
    let rows: Vec<(i64, u64)> = pool.query_rows(sql).await?;

    let mut ids: HashMap<u64, Vec<i64>> = HashMap::new();
    for (id, hash) in rows {
        ids.entry(hash).or_default().push(id);
    }

    Ok(ids)
}

fn column<T>(row: &Row, index: usize, name: &str) -> Result<T>
where
    T: mysql_async::prelude::FromValue,
{
    row.get_opt::<T, _>(index)
        .with_context(|| format!("missing {name} column at index {index}"))?
        .map_err(|e| anyhow!("decoding {name} column: {e}"))
}

/// Splits a `<timestamp>\t<sql>` capture line and trims the SQL side.
fn parse_capture_line(line: &[u8], offset: u64) -> Result<QueryHit> {
    let tab = line
        .iter()
        .position(|&b| b == b'\t')
        .with_context(|| format!("invalid query format in file at offset {offset}"))?;

    let raw = trim_bytes(&line[tab + 1..]);
    if raw.is_empty() {
        bail!("read empty query from file at offset {offset}");
    }

    Ok(QueryHit {
        query: String::from_utf8_lossy(raw).into_owned(),
        fingerprint: String::new(),
    })
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capture_line() {
        let hit =
            parse_capture_line(b"Jun 23, 2025 10:20:26.000 UTC\tselect 1 from t  \n", 0).unwrap();
        assert_eq!(hit.query, "select 1 from t");
    }

    #[test]
    fn test_parse_capture_line_without_tab() {
        let err = parse_capture_line(b"no separator here", 128).unwrap_err();
        assert!(err.to_string().contains("offset 128"));
    }

    #[test]
    fn test_parse_capture_line_empty_sql() {
        assert!(parse_capture_line(b"ts\t   \n", 0).is_err());
    }

    #[test]
    fn test_trim_bytes() {
        assert_eq!(trim_bytes(b"  a b \r\n"), b"a b");
        assert_eq!(trim_bytes(b""), b"");
        assert_eq!(trim_bytes(b" \t "), b"");
    }

    #[test]
    fn test_query_ids_grouping() {
        let mut ids: HashMap<u64, Vec<i64>> = HashMap::new();
        for (id, hash) in [(1i64, 10u64), (2, 10), (3, 20)] {
            ids.entry(hash).or_default().push(id);
        }
        assert_eq!(ids[&10], vec![1, 2]);
        assert_eq!(ids[&20], vec![3]);
    }
}
