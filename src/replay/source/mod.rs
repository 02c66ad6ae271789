//! Replay query sources: where sampled queries come from.
//!
//! Two variants share the sampling contract: the blob-backed source reads a
//! self-describing corpus straight out of a memory map, and the DB-backed
//! source resolves `(offset, length)` rows from the metadata database
//! before reading the original capture out of a memory map.

pub mod blob;
pub mod db;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache::LruCacheStats;
use crate::config::{ReplayConfig, SourceType};

use self::blob::BlobSource;
use self::db::DbSource;

/// A materialized query ready to execute against the target.
#[derive(Debug, Clone, Default)]
pub struct QueryHit {
    pub query: String,
    /// Empty when the source does not carry fingerprint text.
    pub fingerprint: String,
}

/// Counters and timings a source exposes to the reporter.
#[derive(Debug, Clone, Default)]
pub struct SourcePerfStats {
    pub queries_fetch_total: u64,
    pub cache: LruCacheStats,
    pub fetch_weights_lat: Duration,
    pub fetch_ids_lat: Duration,
    pub init_lat: Duration,
    pub queries_loaded: usize,
    pub unique_fingerprints: usize,
}

/// Source variants, dispatched without dynamic allocation.
pub enum QuerySource {
    Blob(BlobSource),
    Db(DbSource),
}

impl QuerySource {
    /// Builds the source selected by the configuration.
    pub fn from_config(cfg: &ReplayConfig) -> Result<Self> {
        let source = &cfg.queries_data_source;
        Ok(match source.source_type {
            SourceType::File => Self::Blob(BlobSource::new(source.file.clone())),
            SourceType::Db => Self::Db(DbSource::new(
                source.db.clone(),
                cfg.concurrency,
                cfg.retry.clone(),
            )),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blob(_) => "file",
            Self::Db(_) => "db",
        }
    }

    /// One-time initialization. The first outcome (success or error) is
    /// latched and returned to every subsequent call.
    pub async fn init(&self) -> Result<()> {
        match self {
            Self::Blob(source) => source.init().await,
            Self::Db(source) => source.init().await,
        }
    }

    /// Draws a weighted-random query from the corpus.
    pub async fn get_random_weighted_query(&self) -> Result<Arc<QueryHit>> {
        match self {
            Self::Blob(source) => source.get_random_weighted_query(),
            Self::Db(source) => source.get_random_weighted_query().await,
        }
    }

    /// Walks the corpus in record order (blob source only).
    pub fn get_sequential_query(&self) -> Result<Arc<QueryHit>> {
        match self {
            Self::Blob(source) => source.get_sequential_query(),
            Self::Db(_) => bail!("sequential mode is not supported by the db source"),
        }
    }

    pub fn perf_stats(&self) -> SourcePerfStats {
        match self {
            Self::Blob(source) => source.perf_stats(),
            Self::Db(source) => source.perf_stats(),
        }
    }

    /// Releases source-held resources (pools, maps).
    pub async fn destroy(&self) {
        if let Self::Db(source) = self {
            source.destroy().await;
        }
    }
}

/// Substitutes `{.ID}` and `{.Hash}` placeholders in a fetch-query template.
pub(crate) fn render_template(template: &str, id: i64, hash: u64) -> String {
    template
        .replace("{.ID}", &id.to_string())
        .replace("{.Hash}", &hash.to_string())
}

/// Maps an `(offset, length)` pair into `data`, checking bounds.
pub(crate) fn slice_checked(data: &[u8], offset: u64, length: u64) -> Result<&[u8]> {
    let offset = usize::try_from(offset).context("offset does not fit in usize")?;
    let length = usize::try_from(length).context("length does not fit in usize")?;
    let end = offset
        .checked_add(length)
        .context("offset + length overflows")?;

    if length == 0 || end > data.len() {
        bail!(
            "invalid query info: offset={offset}, length={length}, buffer_size={}",
            data.len(),
        );
    }

    Ok(&data[offset..end])
}
