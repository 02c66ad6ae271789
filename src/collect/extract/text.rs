//! Tab-delimited timestamped text extractor (tshark dump format).
//!
//! One record per line: `<timestamp>\t<sql>\n`. The timestamp is matched
//! against an ordered list of layouts; the first that parses wins.

use std::io::{BufRead, BufReader, Read};

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Encoding;
use crate::query::Query;

use super::wrap_reader;

/// Ordered timestamp layouts, matching the capture tool's `MST` and
/// lowercase `mst` renderings (month names parse case-insensitively, the
/// zone abbreviation is stripped before parsing and the time is read as
/// UTC).
const TIMESTAMP_LAYOUTS: &[&str] = &["%b %d, %Y %H:%M:%S%.f", "%b %e, %Y %H:%M:%S%.f"];

pub struct TextExtractor {
    reader: BufReader<Box<dyn Read + Send>>,
    seekable: bool,
}

impl TextExtractor {
    pub fn new(path: &str, encoding: Encoding) -> Result<Self> {
        let file = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
        let reader = wrap_reader(encoding, file)?;

        Ok(Self {
            reader: BufReader::new(reader),
            // Offsets below are decoded-stream positions; they equal file
            // positions only when no decompression is stacked on top.
            seekable: encoding == Encoding::Plain,
        })
    }

    /// Streams records until EOF, error, or cancellation. Blocking.
    pub fn run(
        mut self,
        cancel: &CancellationToken,
        out: tokio::sync::mpsc::Sender<Query>,
    ) -> Result<()> {
        let mut offset: u64 = 0;
        let mut emitted: u64 = 0;
        let mut skipped: u64 = 0;
        let mut line = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            line.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut line)
                .context("reading input line")?;
            if n == 0 {
                break;
            }

            let line_start = offset;
            offset += n as u64;

            let mut query = match parse_line(&line) {
                Ok(query) => query,
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "skipping unparseable line");
                    continue;
                }
            };

            if self.seekable {
                query.offset = line_start;
                query.length = n as u64;
            }

            if out.blocking_send(query).is_err() {
                // Downstream is gone; nothing left to do.
                return Ok(());
            }
            emitted += 1;
        }

        if skipped > 0 {
            warn!(skipped, emitted, "text extraction finished with skipped lines");
        } else {
            debug!(emitted, "text extraction finished");
        }

        Ok(())
    }
}

fn parse_line(line: &[u8]) -> Result<Query> {
    let text = std::str::from_utf8(line).context("line is not valid UTF-8")?;

    let Some((timestamp, sql)) = text.split_once('\t') else {
        bail!("invalid line format: no tab separator");
    };

    Ok(Query {
        timestamp: parse_timestamp(timestamp)?,
        raw: sql.trim().as_bytes().to_vec(),
        ..Default::default()
    })
}

fn parse_timestamp(text: &str) -> Result<u64> {
    let text = text.trim();

    // Strip the trailing zone abbreviation the layouts carry.
    let datetime = match text.rsplit_once(' ') {
        Some((datetime, zone)) if zone.chars().all(|c| c.is_ascii_alphabetic()) => datetime,
        _ => text,
    };

    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(datetime, layout) {
            return Ok(parsed.and_utc().timestamp().max(0) as u64);
        }
    }

    bail!("timestamp {text:?} matches no known layout");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let q = parse_line(b"Jun 23, 2025 10:20:26.262728119 UTC\tSELECT 1 FROM t  \n").unwrap();
        assert_eq!(q.raw, b"SELECT 1 FROM t");
        assert_eq!(q.timestamp, 1_750_674_026);
        assert!(!q.completely_processed);
    }

    #[test]
    fn test_parse_line_lowercase_layout() {
        let q = parse_line(b"jun 23, 2025 10:20:26.000000001 utc\tselect 2\n").unwrap();
        assert_eq!(q.timestamp, 1_750_674_026);
    }

    #[test]
    fn test_parse_line_single_digit_day() {
        let q = parse_line(b"Jan 2, 2006 15:04:05.000000000 MST\tselect 3\n").unwrap();
        assert_eq!(q.timestamp, 1_136_214_245);
    }

    #[test]
    fn test_parse_line_rejects_missing_tab() {
        assert!(parse_line(b"no tab here\n").is_err());
    }

    #[test]
    fn test_parse_line_rejects_bad_timestamp() {
        assert!(parse_line(b"not a timestamp\tselect 1\n").is_err());
    }

    #[test]
    fn test_sql_with_embedded_tabs_keeps_remainder() {
        // Only the first tab splits; the SQL may contain more.
        let q = parse_line(b"Jun 23, 2025 10:20:26.000000000 UTC\tselect\t1\n").unwrap();
        assert_eq!(q.raw, b"select\t1");
    }
}
