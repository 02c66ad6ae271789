//! Stats sink: counts queries and fingerprints, prints top-N tables.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::query::Query;

const TOP_N: usize = 10;
const MAX_DISPLAY_LEN: usize = 120;

#[derive(Default)]
pub struct StatsSink {
    query_counts: HashMap<Vec<u8>, u64>,
    fingerprint_counts: HashMap<Vec<u8>, u64>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts records until the channel closes, then prints the report.
    ///
    /// The report tables are the product output of this sink, so they go to
    /// stdout rather than the log.
    pub async fn run(mut self, mut input: mpsc::Receiver<Query>) -> Result<()> {
        while let Some(q) = input.recv().await {
            *self.query_counts.entry(q.raw).or_insert(0) += 1;
            *self.fingerprint_counts.entry(q.fingerprint).or_insert(0) += 1;
        }

        self.print_report();
        Ok(())
    }

    fn print_report(&self) {
        print_table("TOP QUERY COUNTS", "QUERY", &self.query_counts);
        print_table(
            "TOP FINGERPRINT COUNTS",
            "FINGERPRINT",
            &self.fingerprint_counts,
        );

        println!("\n{}", "=".repeat(80));
        println!(
            "SUMMARY: {} unique queries, {} unique fingerprints",
            self.query_counts.len(),
            self.fingerprint_counts.len(),
        );
        println!("{}", "=".repeat(80));
    }
}

fn print_table(title: &str, column: &str, counts: &HashMap<Vec<u8>, u64>) {
    let mut rows: Vec<(&Vec<u8>, u64)> = counts.iter().map(|(k, &v)| (k, v)).collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));

    println!("\n{}", "=".repeat(80));
    println!("{title}");
    println!("{}", "=".repeat(80));
    println!("{:<8} | {:<65}", "COUNT", column);
    println!("{}", "-".repeat(80));

    for (text, count) in rows.iter().take(TOP_N) {
        println!("{:<8} | {:<65}", count, display_text(text));
    }
}

/// Collapses whitespace runs to single spaces and truncates for display.
fn display_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut collapsed = String::with_capacity(text.len());
    let mut last_was_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space && !collapsed.is_empty() {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(c);
            last_was_space = false;
        }
    }

    let collapsed = collapsed.trim_end().to_string();
    if collapsed.len() > MAX_DISPLAY_LEN {
        format!("{}...", &collapsed[..MAX_DISPLAY_LEN])
    } else {
        collapsed
    }
}
