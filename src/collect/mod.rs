//! Collection pipeline orchestration: Extractor → Processor ×N → Sink.
//!
//! Stages hand owned [`crate::query::Query`] records through bounded
//! channels. The extractor closes its channel on success; closure ripples
//! downstream as "no more items". A stage failure cancels the shared token
//! with the failure as the run's cause; every other stage returns at its
//! next suspension point. The orchestrator joins every stage before
//! returning, so files, pools, and caches are dropped only after the last
//! worker exits.

pub mod extract;
pub mod processor;
pub mod sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::CollectConfig;

use self::extract::Extractor;
use self::processor::Processor;
use self::sink::Sink;

/// Runs the collection pipeline to completion.
///
/// Cancelling `cancel` (e.g. from a signal handler) shuts the pipeline down
/// cleanly and returns `Ok`.
pub async fn run(cfg: CollectConfig, cancel: CancellationToken) -> Result<()> {
    let capacity = cfg.pipeline.channel_capacity;
    let (extracted_tx, extracted_rx) = mpsc::channel(capacity);
    let (processed_tx, processed_rx) = mpsc::channel(capacity);

    let extractor = Extractor::from_config(&cfg).context("creating input")?;
    let processor = Arc::new(Processor::new(cfg.processor.clone()).context("creating processor")?);
    let sink = Sink::from_config(&cfg).context("creating output")?;

    info!(
        input = extractor.name(),
        output = sink.name(),
        workers = cfg.processor.max_concurrency,
        "starting collection pipeline",
    );

    let mut stages: tokio::task::JoinSet<(&'static str, Result<()>)> = tokio::task::JoinSet::new();

    {
        let cancel = cancel.clone();
        stages.spawn_blocking(move || ("extractor", extractor.run(&cancel, extracted_tx)));
    }

    {
        let cancel = cancel.clone();
        stages.spawn(async move {
            ("processor", processor.run(cancel, extracted_rx, processed_tx).await)
        });
    }

    {
        let cancel = cancel.clone();
        stages.spawn(async move { ("sink", sink.run(cancel, processed_rx).await) });
    }

    let mut cause: Option<anyhow::Error> = None;

    while let Some(joined) = stages.join_next().await {
        let (stage, result) = joined.context("pipeline stage panicked")?;
        match result {
            Ok(()) => info!(stage, "stage completed"),
            Err(e) => {
                error!(stage, error = format!("{e:#}"), "stage failed");
                if cause.is_none() {
                    cause = Some(e.context(format!("{stage} failed")));
                }
                // First failure stops the whole pipeline.
                cancel.cancel();
            }
        }
    }

    match cause {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
