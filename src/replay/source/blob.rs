//! Blob-backed replay source: a memory-mapped self-describing corpus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::OnceCell;
use tracing::info;

use crate::cache::{LruCache, LruCacheStats};
use crate::codec::BlobReader;
use crate::config::FileSourceConfig;
use crate::replay::weights::{FingerprintData, FingerprintWeights};

use super::{slice_checked, QueryHit, SourcePerfStats};

/// Read-only corpus state built exactly once.
struct BlobState {
    mmap: Mmap,
    /// `(offset, length)` per dense query id.
    query_infos: Vec<(u64, u64)>,
    /// fingerprint hash → query ids carrying that fingerprint.
    fingerprint_index: HashMap<u64, Vec<usize>>,
    weights: FingerprintWeights,
    init_lat: std::time::Duration,
}

pub struct BlobSource {
    cfg: FileSourceConfig,
    /// Latch caching the first init outcome, success or error.
    state: OnceCell<Result<Arc<BlobState>, String>>,
    /// Per-fingerprint query caches, created lazily under double-check.
    caches: RwLock<HashMap<u64, Arc<LruCache<usize, Arc<QueryHit>>>>>,
    fetch_total: AtomicU64,
    sequential_cursor: AtomicUsize,
}

impl BlobSource {
    pub fn new(cfg: FileSourceConfig) -> Self {
        Self {
            cfg,
            state: OnceCell::new(),
            caches: RwLock::new(HashMap::new()),
            fetch_total: AtomicU64::new(0),
            sequential_cursor: AtomicUsize::new(0),
        }
    }

    /// Maps and indexes the corpus. Subsequent calls return the latched
    /// first outcome.
    pub async fn init(&self) -> Result<()> {
        let outcome = self
            .state
            .get_or_init(|| async {
                let path = self.cfg.input_file.clone();
                match tokio::task::spawn_blocking(move || load_blob(&path)).await {
                    Ok(Ok(state)) => Ok(Arc::new(state)),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(e) => Err(format!("corpus load task failed: {e}")),
                }
            })
            .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!("{e}")),
        }
    }

    fn state(&self) -> Result<Arc<BlobState>> {
        match self.state.get() {
            Some(Ok(state)) => Ok(Arc::clone(state)),
            Some(Err(e)) => Err(anyhow!("{e}")),
            None => bail!("query source is not initialized"),
        }
    }

    /// Weighted fingerprint → uniform query id → cache → mmap read.
    pub fn get_random_weighted_query(&self) -> Result<Arc<QueryHit>> {
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
            .fingerprint_index
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

        let hit = Arc::new(self.read_query(&state, id)?);

        // Double-checked lazy cache creation, sized to the id list.
        let cache = match cache {
            Some(cache) => cache,
            None => {
                let mut caches = self.caches.write();
                Arc::clone(
                    caches
                        .entry(fingerprint.hash)
                        .or_insert_with(|| Arc::new(LruCache::new(ids.len().max(1)))),
                )
            }
        };
        cache.set(id, Arc::clone(&hit));

        self.fetch_total.fetch_add(1, Ordering::Relaxed);
        Ok(hit)
    }

    /// Walks query ids in corpus order with a shared atomic cursor.
    pub fn get_sequential_query(&self) -> Result<Arc<QueryHit>> {
        let state = self.state()?;
        if state.query_infos.is_empty() {
            bail!("corpus holds no queries");
        }

        let id = self.sequential_cursor.fetch_add(1, Ordering::Relaxed) % state.query_infos.len();
        let hit = self.read_query(&state, id)?;

        self.fetch_total.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(hit))
    }

    fn read_query(&self, state: &BlobState, id: usize) -> Result<QueryHit> {
        let (offset, length) = state.query_infos[id];
        let bytes = slice_checked(&state.mmap, offset, length)?;

        Ok(QueryHit {
            query: String::from_utf8_lossy(bytes).into_owned(),
            fingerprint: String::new(),
        })
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
            stats.init_lat = state.init_lat;
            stats.queries_loaded = state.query_infos.len();
            stats.unique_fingerprints = state.fingerprint_index.len();
        }

        stats
    }
}

/// Maps the blob and builds the id/index/weight structures.
fn load_blob(path: &str) -> Result<BlobState> {
    let start = Instant::now();

    let file = std::fs::File::open(path).with_context(|| format!("opening corpus {path}"))?;
    // Safety: the corpus file is treated as read-only for the process
    // lifetime; concurrent truncation by another process is out of contract.
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("memory-mapping {path}"))?;

    let mut query_infos: Vec<(u64, u64)> = Vec::new();
    let mut fingerprint_index: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut fingerprint_counts: HashMap<u64, i64> = HashMap::new();

    let mut reader = BlobReader::new(&mmap);
    while let Some(record) = reader.next_record() {
        let record = record.context("scanning corpus blob")?;

        // Zero-length records are upstream rejects; skip but keep walking.
        if record.raw.is_empty() {
            continue;
        }

        let id = query_infos.len();
        query_infos.push((record.offset as u64, record.raw.len() as u64));
        fingerprint_index
            .entry(record.fingerprint_hash)
            .or_default()
            .push(id);
        *fingerprint_counts.entry(record.fingerprint_hash).or_insert(0) += 1;
    }

    let total = query_infos.len();
    if total == 0 {
        bail!("no valid queries found in corpus {path}");
    }

    let mut weights = FingerprintWeights::new();
    for (hash, count) in fingerprint_counts {
        weights.add(
            count as f64 / total as f64,
            FingerprintData {
                hash,
                freq_total: count,
            },
        );
    }

    if weights.total_weight() <= 0.0 {
        bail!("corpus {path} produced a zero-weight distribution");
    }

    let init_lat = start.elapsed();
    info!(
        path,
        queries_loaded = total,
        unique_fingerprints = fingerprint_index.len(),
        elapsed = ?init_lat,
        "corpus blob loaded and indexed",
    );

    Ok(BlobState {
        mmap,
        query_infos,
        fingerprint_index,
        weights,
        init_lat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_blob_record;
    use std::io::Write;

    fn write_corpus(records: &[(&[u8], u64)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut blob = Vec::new();
        for (raw, hash) in records {
            write_blob_record(&mut blob, raw, *hash).unwrap();
        }
        file.write_all(&blob).unwrap();
        file.flush().unwrap();
        file
    }

    fn source_for(file: &tempfile::NamedTempFile) -> BlobSource {
        BlobSource::new(FileSourceConfig {
            input_file: file.path().to_str().unwrap().to_string(),
        })
    }

    #[tokio::test]
    async fn test_init_and_sample() {
        let file = write_corpus(&[
            (b"select 1", 0xa),
            (b"select 2", 0xa),
            (b"update t set x = 3", 0xb),
        ]);
        let source = source_for(&file);
        source.init().await.unwrap();

        for _ in 0..50 {
            let hit = source.get_random_weighted_query().unwrap();
            assert!(
                hit.query.starts_with("select") || hit.query.starts_with("update"),
                "unexpected query {:?}",
                hit.query,
            );
        }

        let stats = source.perf_stats();
        assert_eq!(stats.queries_loaded, 3);
        assert_eq!(stats.unique_fingerprints, 2);
        assert_eq!(stats.queries_fetch_total, 50);
        // Everything after the first miss per id comes from cache.
        assert!(stats.cache.hits_total > 0);
    }

    #[tokio::test]
    async fn test_sequential_walks_in_order() {
        let file = write_corpus(&[(b"q1", 1), (b"q2", 2), (b"q3", 3)]);
        let source = source_for(&file);
        source.init().await.unwrap();

        let seen: Vec<String> = (0..3)
            .map(|_| source.get_sequential_query().unwrap().query.clone())
            .collect();
        assert_eq!(seen, vec!["q1", "q2", "q3"]);

        // Cursor wraps around.
        assert_eq!(source.get_sequential_query().unwrap().query, "q1");
    }

    #[tokio::test]
    async fn test_empty_records_are_skipped() {
        let file = write_corpus(&[(b"", 1), (b"select 1", 2)]);
        let source = source_for(&file);
        source.init().await.unwrap();
        assert_eq!(source.perf_stats().queries_loaded, 1);
    }

    #[tokio::test]
    async fn test_empty_corpus_fails_init() {
        let file = write_corpus(&[]);
        let source = source_for(&file);
        let err = source.init().await.unwrap_err();
        assert!(err.to_string().contains("no valid queries"));
    }

    #[tokio::test]
    async fn test_corrupt_corpus_fails_init() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9, 0, 0, 0, b'x']).unwrap();
        file.flush().unwrap();

        let source = source_for(&file);
        let err = source.init().await.unwrap_err();
        assert!(err.to_string().contains("corrupt blob"), "got: {err:#}");
    }

    #[tokio::test]
    async fn test_init_latches_first_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.blob");

        let source = BlobSource::new(FileSourceConfig {
            input_file: path.to_str().unwrap().to_string(),
        });

        // First init fails: no file yet.
        assert!(source.init().await.is_err());

        // Creating a valid corpus afterwards does not unlatch the error.
        let mut blob = Vec::new();
        write_blob_record(&mut blob, b"select 1", 1).unwrap();
        std::fs::write(&path, &blob).unwrap();
        assert!(source.init().await.is_err());
    }

    #[tokio::test]
    async fn test_uninitialized_sample_fails() {
        let file = write_corpus(&[(b"select 1", 1)]);
        let source = source_for(&file);
        assert!(source.get_random_weighted_query().is_err());
    }
}
