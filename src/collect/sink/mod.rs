//! Collection sinks: where processed records land.

pub mod blob;
pub mod db;
pub mod stats;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CollectConfig, OutputType};
use crate::query::Query;

use self::blob::BlobSink;
use self::db::DbSink;
use self::stats::StatsSink;

/// Sink variants, dispatched without dynamic allocation.
pub enum Sink {
    Blob(BlobSink),
    Db(DbSink),
    Stats(StatsSink),
}

impl Sink {
    /// Builds the sink selected by the configuration.
    pub fn from_config(cfg: &CollectConfig) -> Result<Self> {
        let output_type = cfg
            .output
            .output_type
            .context("output.type is not configured")?;

        Ok(match output_type {
            OutputType::Cache => Self::Blob(
                BlobSink::new(&cfg.output.cache, cfg.output.encoding)
                    .context("creating blob sink")?,
            ),
            OutputType::Db => {
                Self::Db(DbSink::new(cfg.output.db.clone()).context("creating db sink")?)
            }
            OutputType::Stats => Self::Stats(StatsSink::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blob(_) => "cache",
            Self::Db(_) => "db",
            Self::Stats(_) => "stats",
        }
    }

    /// Drains the processed-record channel to completion.
    pub async fn run(
        self,
        cancel: CancellationToken,
        input: mpsc::Receiver<Query>,
    ) -> Result<()> {
        match self {
            // File I/O is synchronous; run it on a blocking thread.
            Self::Blob(sink) => tokio::task::spawn_blocking(move || sink.run(input))
                .await
                .context("blob sink task panicked")?,
            Self::Db(sink) => sink.run(cancel, input).await,
            Self::Stats(sink) => sink.run(input).await,
        }
    }
}
