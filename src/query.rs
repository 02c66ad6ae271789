//! The query record shared by the collection and replay pipelines, plus the
//! byte-level filters applied before a record enters the corpus.

/// A single captured query moving through the pipeline.
///
/// Created by an extractor, normalized and hashed by exactly one processor
/// worker, then serialized by a sink. Ownership transfers through the stage
/// channels; workers never share a record.
#[derive(Debug, Default, Clone)]
pub struct Query {
    /// Canonicalized SQL bytes.
    pub raw: Vec<u8>,
    /// SQL with literals replaced by placeholders.
    pub fingerprint: Vec<u8>,
    /// Stable 64-bit xxhash of `raw`. Zero means "not yet computed".
    pub hash: u64,
    /// Stable 64-bit xxhash of `fingerprint`. Zero means "not yet computed".
    pub fingerprint_hash: u64,
    /// Capture time, seconds since the epoch.
    pub timestamp: u64,
    /// Byte position of the record in the source stream.
    pub offset: u64,
    /// Byte length of the record in the source stream.
    pub length: u64,
    /// Set once normalization, hashing, and fingerprinting are done.
    pub completely_processed: bool,
}

#[inline]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Removes leading and trailing whitespace from `buf` in place.
///
/// The underlying allocation is kept; only the length changes.
pub fn trim_in_place(buf: &mut Vec<u8>) {
    let start = buf.iter().position(|&b| !is_space(b)).unwrap_or(buf.len());
    let end = buf
        .iter()
        .rposition(|&b| !is_space(b))
        .map_or(0, |idx| idx + 1);

    if start > 0 {
        buf.copy_within(start..end, 0);
    }
    buf.truncate(end.saturating_sub(start));
}

/// ASCII-lowercases `buf` in place, reusing the record's own storage.
pub fn to_lower_in_place(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        b.make_ascii_lowercase();
    }
}

fn contains_non_printable(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| !(0x20..=0x7e).contains(&b))
}

/// Rejects obviously invalid queries before any normalization work.
///
/// Lowercases the buffer in place as a side effect (the prefix check and the
/// downstream keyword normalization both want lowercase anyway).
pub fn is_valid_query(raw: &mut [u8]) -> bool {
    if raw.is_empty() {
        return false;
    }

    let probe = &raw[..raw.len().min(25)];
    if contains_non_printable(probe) {
        return false;
    }

    to_lower_in_place(raw);
    if raw.starts_with(b"use ") || raw.starts_with(b"set ") {
        return false;
    }

    true
}

/// True when `fingerprint` matches none of the blacklisted byte prefixes.
pub fn is_valid_fingerprint(fingerprint: &[u8], blacklist: &[Vec<u8>]) -> bool {
    !blacklist
        .iter()
        .any(|prefix| fingerprint.starts_with(prefix))
}
