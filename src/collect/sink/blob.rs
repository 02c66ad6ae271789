//! Blob sink: appends processed records to a framed binary file.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::codec::{write_blob_record, MetaRecord, META_RECORD_SIZE};
use crate::config::{BlobFormat, CacheOutputConfig, Encoding};
use crate::query::Query;

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Output writer stack; kept as an enum so the shutdown path can finish
/// each encoder explicitly instead of trusting drop glue.
enum BlobWriter {
    Plain(BufWriter<File>),
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl BlobWriter {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Plain(w) => w,
            Self::Gzip(w) => w,
            Self::Zstd(w) => w,
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gzip(w) => w.finish()?.flush(),
            Self::Zstd(w) => w.finish()?.flush(),
        }
    }
}

pub struct BlobSink {
    writer: BlobWriter,
    format: BlobFormat,
    path: String,
}

impl BlobSink {
    pub fn new(cfg: &CacheOutputConfig, encoding: Encoding) -> Result<Self> {
        let file = File::create(&cfg.file).with_context(|| format!("creating {}", cfg.file))?;
        let buffered = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let writer = match encoding {
            Encoding::Plain => BlobWriter::Plain(buffered),
            Encoding::Gzip => BlobWriter::Gzip(flate2::write::GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            )),
            Encoding::Zstd => BlobWriter::Zstd(
                zstd::stream::write::Encoder::new(buffered, 0)
                    .context("creating zstd encoder")?,
            ),
        };

        Ok(Self {
            writer,
            format: cfg.format,
            path: cfg.file.clone(),
        })
    }

    /// Drains the channel to the blob file. Blocking; flushes and closes on
    /// upstream close. I/O errors are fatal, with no retries.
    pub fn run(mut self, mut input: mpsc::Receiver<Query>) -> Result<()> {
        let mut written: u64 = 0;
        let mut meta_buf = [0u8; META_RECORD_SIZE];

        while let Some(q) = input.blocking_recv() {
            match self.format {
                BlobFormat::Queries => {
                    write_blob_record(self.writer.writer(), &q.raw, q.fingerprint_hash)
                        .context("writing query record")?;
                }
                BlobFormat::Metadata => {
                    let record = MetaRecord {
                        hash: q.hash,
                        fingerprint_hash: q.fingerprint_hash,
                        offset: q.offset,
                        length: q.length,
                    };
                    record.encode(&mut meta_buf);
                    self.writer
                        .writer()
                        .write_all(&meta_buf)
                        .context("writing metadata record")?;
                }
            }
            written += 1;
        }

        self.writer.finish().context("flushing blob output")?;
        info!(written, path = %self.path, "blob output completed");

        Ok(())
    }
}
