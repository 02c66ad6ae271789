//! Parallel normalize + hash + fingerprint stage.
//!
//! N workers pull records off the extraction channel, canonicalize them, and
//! forward the survivors. Normalization results and hashes are cached by the
//! exact byte string they were computed from, so repeated traffic costs one
//! lexer pass total.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use xxhash_rust::xxh64::xxh64;

use crate::config::ProcessorConfig;
use crate::query::{is_valid_fingerprint, is_valid_query, trim_in_place, Query};
use crate::sqlnorm::lexer::Lexer;
use crate::sqlnorm::{normalize, KeywordCase, NormalizeConfig, NormalizeError};

const RAW_NORMALIZE: NormalizeConfig = NormalizeConfig {
    keyword_case: KeywordCase::Lower,
    remove_literals: false,
};

const FINGERPRINT_NORMALIZE: NormalizeConfig = NormalizeConfig {
    keyword_case: KeywordCase::Lower,
    remove_literals: true,
};

/// Read-mostly cache keyed by the full byte string.
#[derive(Debug)]
struct ByteCache<V> {
    data: RwLock<HashMap<Vec<u8>, V>>,
}

impl<V: Clone> ByteCache<V> {
    fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &[u8]) -> Option<V> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: Vec<u8>, value: V) -> V {
        self.data.write().insert(key, value.clone());
        value
    }
}

#[derive(Debug)]
pub struct Processor {
    cfg: ProcessorConfig,
    blacklist: Vec<Vec<u8>>,

    raw_cache: ByteCache<Vec<u8>>,
    raw_hash_cache: ByteCache<u64>,
    fingerprint_cache: ByteCache<Vec<u8>>,
    fingerprint_hash_cache: ByteCache<u64>,

    progress: AtomicU64,
    rejected: AtomicU64,
    blacklisted: AtomicU64,
}

impl Processor {
    pub fn new(cfg: ProcessorConfig) -> Result<Self> {
        if cfg.max_concurrency == 0 {
            bail!("max concurrency must be greater than 0");
        }

        let blacklist = cfg
            .blacklist_fingerprint_prefixes
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        Ok(Self {
            cfg,
            blacklist,
            raw_cache: ByteCache::new(),
            raw_hash_cache: ByteCache::new(),
            fingerprint_cache: ByteCache::new(),
            fingerprint_hash_cache: ByteCache::new(),
            progress: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            blacklisted: AtomicU64::new(0),
        })
    }

    /// Total records pulled off the input channel so far.
    pub fn processed_total(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Runs the worker pool until the input channel closes or cancellation.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        input: mpsc::Receiver<Query>,
        output: mpsc::Sender<Query>,
    ) -> Result<()> {
        let input = Arc::new(tokio::sync::Mutex::new(input));
        let mut workers = tokio::task::JoinSet::new();

        for _ in 0..self.cfg.max_concurrency {
            let processor = Arc::clone(&self);
            let cancel = cancel.clone();
            let input = Arc::clone(&input);
            let output = output.clone();

            workers.spawn(async move {
                let lexer = Lexer::new();
                let mut workspace: Vec<u8> = Vec::new();

                loop {
                    let record = tokio::select! {
                        _ = cancel.cancelled() => return Ok::<(), anyhow::Error>(()),
                        record = async { input.lock().await.recv().await } => record,
                    };

                    let Some(record) = record else {
                        return Ok(());
                    };

                    processor.progress.fetch_add(1, Ordering::Relaxed);

                    if let Some(processed) =
                        processor.process_record(&lexer, &mut workspace, record)
                    {
                        if output.send(processed).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            });
        }
        drop(output);

        let progress_task = Self::spawn_progress_reporter(Arc::clone(&self), cancel.child_token());

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let worker_result = joined.context("processor worker panicked")?;
            if result.is_ok() {
                result = worker_result;
            }
        }

        progress_task.abort();

        info!(
            processed = self.processed_total(),
            rejected = self.rejected.load(Ordering::Relaxed),
            blacklisted = self.blacklisted.load(Ordering::Relaxed),
            "processor finished",
        );

        result
    }

    /// Canonicalizes one record. Returns `None` when the record is dropped.
    ///
    /// An already-processed record passes through unchanged.
    fn process_record(&self, lexer: &Lexer, workspace: &mut Vec<u8>, mut q: Query) -> Option<Query> {
        if q.completely_processed {
            return Some(q);
        }

        trim_in_place(&mut q.raw);

        if !is_valid_query(&mut q.raw) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if workspace.len() < q.raw.len() + 1024 {
            // Normalization may need more room than the input.
            workspace.resize(q.raw.len() + 1024, 0);
        }

        q.raw = normalize_cached(lexer, &RAW_NORMALIZE, &q.raw, &self.raw_cache, workspace);

        if q.hash == 0 {
            q.hash = match self.raw_hash_cache.get(&q.raw) {
                Some(hash) => hash,
                None => self.raw_hash_cache.set(q.raw.clone(), xxh64(&q.raw, 0)),
            };
        }

        if q.fingerprint.is_empty() {
            q.fingerprint = normalize_cached(
                lexer,
                &FINGERPRINT_NORMALIZE,
                &q.raw,
                &self.fingerprint_cache,
                workspace,
            );
        }

        if q.fingerprint_hash == 0 && !q.fingerprint.is_empty() {
            q.fingerprint_hash = match self.fingerprint_hash_cache.get(&q.fingerprint) {
                Some(hash) => hash,
                None => self
                    .fingerprint_hash_cache
                    .set(q.fingerprint.clone(), xxh64(&q.fingerprint, 0)),
            };
        }

        if !is_valid_fingerprint(&q.fingerprint, &self.blacklist) {
            self.blacklisted.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        q.completely_processed = true;
        Some(q)
    }

    fn spawn_progress_reporter(
        processor: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = processor.cfg.progress_interval.max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let current = processor.processed_total();
                        if current > 0 {
                            let rate = (current - last) as f64 / interval.as_secs_f64();
                            info!(processed = current, per_second = rate as u64, "processing");
                        }
                        last = current;
                    }
                }
            }
        })
    }
}

/// Returns the cached normalization of `input`, computing and caching it on
/// a miss. Grows `workspace` and retries when the normalizer reports it too
/// small.
fn normalize_cached(
    lexer: &Lexer,
    cfg: &NormalizeConfig,
    input: &[u8],
    cache: &ByteCache<Vec<u8>>,
    workspace: &mut Vec<u8>,
) -> Vec<u8> {
    if let Some(cached) = cache.get(input) {
        return cached;
    }

    loop {
        match normalize(cfg, lexer, input, workspace) {
            Ok(n) => {
                return cache.set(input.to_vec(), workspace[..n].to_vec());
            }
            Err(NormalizeError::BufferTooSmall { needed }) => {
                let grown = needed.max(workspace.len() * 2).max(64);
                workspace.resize(grown, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor_with(blacklist: Vec<String>) -> Processor {
        Processor::new(ProcessorConfig {
            max_concurrency: 2,
            progress_interval: Duration::from_secs(5),
            blacklist_fingerprint_prefixes: blacklist,
        })
        .unwrap()
    }

    fn record(raw: &[u8]) -> Query {
        Query {
            raw: raw.to_vec(),
            timestamp: 1_750_674_026,
            ..Default::default()
        }
    }

    fn process(processor: &Processor, q: Query) -> Option<Query> {
        let lexer = Lexer::new();
        let mut workspace = Vec::new();
        processor.process_record(&lexer, &mut workspace, q)
    }

    #[test]
    fn test_processes_valid_query() {
        let processor = processor_with(vec![]);
        let q = process(
            &processor,
            record(b"  SELECT name FROM users WHERE id = 42  "),
        )
        .unwrap();

        assert!(q.completely_processed);
        assert_eq!(q.raw, b"select name from users where id = 42");
        assert_eq!(q.fingerprint, b"select name from users where id = ?");
        assert_eq!(q.hash, xxh64(&q.raw, 0));
        assert_eq!(q.fingerprint_hash, xxh64(&q.fingerprint, 0));
        assert_ne!(q.hash, 0);
        assert_ne!(q.fingerprint_hash, 0);
    }

    #[test]
    fn test_already_processed_passes_through_unchanged() {
        let processor = processor_with(vec![]);
        let mut q = record(b"  anything, even unparsed  ");
        q.hash = 7;
        q.fingerprint_hash = 8;
        q.completely_processed = true;

        let out = process(&processor, q.clone()).unwrap();
        assert_eq!(out.raw, q.raw);
        assert_eq!(out.hash, 7);
        assert_eq!(out.fingerprint_hash, 8);
        assert_eq!(processor.rejected.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_drops_empty_and_session_statements() {
        let processor = processor_with(vec![]);
        assert!(process(&processor, record(b"   ")).is_none());
        assert!(process(&processor, record(b"USE production")).is_none());
        assert!(process(&processor, record(b"SET autocommit=1")).is_none());
        assert_eq!(processor.rejected.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_drops_blacklisted_fingerprint() {
        let processor = processor_with(vec!["select * from rule_state".to_string()]);
        assert!(process(&processor, record(b"SELECT * FROM rule_state WHERE id = 1")).is_none());
        assert_eq!(processor.blacklisted.load(Ordering::Relaxed), 1);

        // Non-matching queries still flow.
        assert!(process(&processor, record(b"SELECT * FROM users")).is_some());
    }

    #[test]
    fn test_identical_queries_share_hashes() {
        let processor = processor_with(vec![]);
        let a = process(&processor, record(b"select a from t where b = 1")).unwrap();
        let b = process(&processor, record(b"select a from t where b = 1")).unwrap();
        let c = process(&processor, record(b"select a from t where b = 2")).unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.fingerprint_hash, b.fingerprint_hash);
        assert_ne!(a.hash, c.hash);
        // Same shape, different literal: same fingerprint.
        assert_eq!(a.fingerprint_hash, c.fingerprint_hash);
    }

    #[test]
    fn test_existing_hash_is_kept() {
        let processor = processor_with(vec![]);
        let mut q = record(b"select 1");
        q.hash = 1234;
        let out = process(&processor, q).unwrap();
        assert_eq!(out.hash, 1234);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = Processor::new(ProcessorConfig {
            max_concurrency: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
