//! SQL normalization: whitespace/comment canonicalization, keyword case
//! folding, and literal replacement for fingerprinting.
//!
//! The normalizer writes into a caller-owned output buffer and reports
//! [`NormalizeError::BufferTooSmall`] when it runs out of room; callers grow
//! the buffer and retry, so one workspace allocation is reused across
//! millions of records.

pub mod lexer;

use thiserror::Error;

use self::lexer::{Lexer, TokenKind};

/// Keyword case folding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordCase {
    Unchanged,
    Lower,
}

/// Normalization settings.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeConfig {
    pub keyword_case: KeywordCase,
    /// Replace string and numeric literals with `?` (fingerprinting).
    pub remove_literals: bool,
}

/// Errors surfaced by [`normalize`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    /// The output buffer cannot hold the normalized statement. The caller
    /// should grow the buffer to at least `needed` bytes and retry.
    #[error("output buffer too small: need at least {needed} bytes")]
    BufferTooSmall { needed: usize },
}

/// MySQL keywords folded by [`KeywordCase::Lower`]. Must stay sorted:
/// lookups binary-search it.
const KEYWORDS: &[&str] = &[
    "all", "alter", "and", "as", "asc", "auto_increment", "avg", "begin", "between", "bigint",
    "by", "case", "coalesce", "commit", "count", "create", "cross", "database", "default",
    "delete", "desc", "distinct", "drop", "duplicate", "else", "end", "exists", "explain",
    "foreign", "from", "group", "having", "if", "ifnull", "ignore", "in", "index", "inner",
    "insert", "int", "interval", "into", "is", "join", "key", "left", "like", "limit", "lock",
    "max", "min", "not", "now", "null", "offset", "on", "or", "order", "outer", "primary",
    "references", "replace", "right", "rollback", "select", "set", "show", "straight_join",
    "sum", "table", "text", "then", "timestamp", "union", "unsigned", "update", "use", "using",
    "values", "varchar", "when", "where",
];

fn is_keyword(word: &[u8]) -> bool {
    if word.len() > 16 {
        return false;
    }
    let mut lower = [0u8; 16];
    for (dst, src) in lower.iter_mut().zip(word) {
        *dst = src.to_ascii_lowercase();
    }
    let lower = &lower[..word.len()];
    KEYWORDS
        .binary_search_by(|kw| kw.as_bytes().cmp(lower))
        .is_ok()
}

struct OutBuf<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl OutBuf<'_> {
    fn push(&mut self, b: u8) -> Result<(), NormalizeError> {
        if self.pos >= self.out.len() {
            return Err(NormalizeError::BufferTooSmall {
                needed: self.pos + 1,
            });
        }
        self.out[self.pos] = b;
        self.pos += 1;
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), NormalizeError> {
        if self.pos + bytes.len() > self.out.len() {
            return Err(NormalizeError::BufferTooSmall {
                needed: self.pos + bytes.len(),
            });
        }
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    fn extend_lower(&mut self, bytes: &[u8]) -> Result<(), NormalizeError> {
        if self.pos + bytes.len() > self.out.len() {
            return Err(NormalizeError::BufferTooSmall {
                needed: self.pos + bytes.len(),
            });
        }
        for &b in bytes {
            self.out[self.pos] = b.to_ascii_lowercase();
            self.pos += 1;
        }
        Ok(())
    }
}

/// Normalizes `input` into `out`, returning the number of bytes written.
///
/// Whitespace runs collapse to a single space, comments are dropped, and
/// token spacing is made canonical (no space after `(` or before `,`, `)`,
/// `;`). Keywords are case-folded per the config; with `remove_literals`,
/// string and numeric literals become `?`.
pub fn normalize(
    cfg: &NormalizeConfig,
    lexer: &Lexer,
    input: &[u8],
    out: &mut [u8],
) -> Result<usize, NormalizeError> {
    let mut buf = OutBuf { out, pos: 0 };
    let mut last: Option<u8> = None;

    for token in lexer.tokens(input) {
        if matches!(token.kind, TokenKind::Whitespace | TokenKind::Comment) {
            continue;
        }

        let emitted: &[u8] = match token.kind {
            TokenKind::StringLit | TokenKind::NumberLit if cfg.remove_literals => &b"?"[..],
            _ => token.text,
        };
        let first = emitted[0];

        // Canonical spacing: attach closers and separators to the previous
        // token, and the token following an opening paren to the paren.
        let suppress = matches!(first, b',' | b')' | b';') || last == Some(b'(');
        if last.is_some() && !suppress {
            buf.push(b' ')?;
        }

        match token.kind {
            TokenKind::Word if cfg.keyword_case == KeywordCase::Lower && is_keyword(token.text) => {
                buf.extend_lower(token.text)?;
            }
            _ => buf.extend(emitted)?,
        }

        last = Some(*emitted.last().unwrap_or(&b'?'));
    }

    Ok(buf.pos)
}

/// Convenience wrapper that retries with a growing buffer and returns an
/// owned vector. Normalization of traffic-sized statements cannot fail.
pub fn normalize_to_vec(cfg: &NormalizeConfig, lexer: &Lexer, input: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; input.len() + 64];
    loop {
        match normalize(cfg, lexer, input, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return buf;
            }
            Err(NormalizeError::BufferTooSmall { needed }) => {
                buf.resize(needed.max(buf.len() * 2), 0);
            }
        }
    }
}
