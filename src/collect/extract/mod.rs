//! Capture input extractors.
//!
//! Each extractor streams its input format into [`Query`] records on the
//! pipeline's first channel. Extraction is synchronous file I/O, so the
//! orchestrator runs it on a blocking-capable thread; records are handed to
//! the async stages with `blocking_send`.

pub mod pcap;
pub mod text;

use std::fs::File;
use std::io::Read;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{CollectConfig, Encoding, InputType};
use crate::query::Query;

use self::pcap::PcapExtractor;
use self::text::TextExtractor;

/// Wraps a file in the configured streaming decoder.
pub(crate) fn wrap_reader(encoding: Encoding, file: File) -> Result<Box<dyn Read + Send>> {
    Ok(match encoding {
        Encoding::Plain => Box::new(file),
        Encoding::Gzip => Box::new(flate2::read::MultiGzDecoder::new(file)),
        Encoding::Zstd => {
            Box::new(zstd::stream::read::Decoder::new(file).context("creating zstd decoder")?)
        }
    })
}

/// Extractor variants, dispatched without dynamic allocation.
pub enum Extractor {
    Text(TextExtractor),
    Pcap(PcapExtractor),
}

impl Extractor {
    /// Builds the extractor selected by the configuration.
    pub fn from_config(cfg: &CollectConfig) -> Result<Self> {
        let input_type = cfg
            .input
            .input_type
            .context("input.type is not configured")?;

        Ok(match input_type {
            InputType::TsharkTxt => Self::Text(
                TextExtractor::new(&cfg.input.tshark_txt.file, cfg.input.encoding)
                    .context("creating tshark-txt extractor")?,
            ),
            InputType::Pcap => Self::Pcap(
                PcapExtractor::new(&cfg.input.pcap.file, cfg.input.encoding)
                    .context("creating pcap extractor")?,
            ),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Text(_) => "tshark-txt",
            Self::Pcap(_) => "pcap",
        }
    }

    /// Runs extraction to completion, EOF, error, or cancellation.
    ///
    /// Blocking; call from a blocking-capable task. The output sender is
    /// dropped on return, which signals "no more records" downstream.
    pub fn run(
        self,
        cancel: &CancellationToken,
        out: tokio::sync::mpsc::Sender<Query>,
    ) -> Result<()> {
        match self {
            Self::Text(extractor) => extractor.run(cancel, out),
            Self::Pcap(extractor) => extractor.run(cancel, out),
        }
    }
}
