//! Key expressions: canonicalization, intersection and inclusion.
//!
//! A key expression is a `/`-separated path of lowercase chunks. `*`
//! matches exactly one chunk, `**` matches zero or more chunks, `$*`
//! matches within a chunk. Canonical form collapses repeated slashes and
//! adjacent `**`, folds `$*$*` into `$*`, rewrites a bare `$*` chunk to
//! `*` and orders `*` before `**` (`**/*` and `*/**` name the same set).
//!
//! Matching runs on canonical inputs, walking chunks with a two-pointer
//! scheme and explicit backtracking for the multi-chunk wildcard. No
//! allocation happens on the matching paths.

use crate::error::{TernError, TernResult};
use smallvec::SmallVec;

const VERBATIM: &str = "**";
const SINGLE: &str = "*";
const SUBSTRING: &[u8] = b"$*";

/// Bring `s` to canonical form, or reject it.
pub fn canonicalize(s: &str) -> TernResult<String> {
    let mut chunks: SmallVec<[String; 8]> = SmallVec::new();
    for raw in s.split('/') {
        if raw.is_empty() {
            // Repeated, leading or trailing slashes fold away.
            continue;
        }
        let chunk = raw.to_ascii_lowercase();
        validate_chunk(&chunk).map_err(|what| {
            TernError::InvalidArgument(format!("key expression `{s}`: {what}"))
        })?;
        let chunk = fold_substring_runs(&chunk);
        // Adjacent multi-chunk wildcards collapse.
        if chunk == VERBATIM && chunks.last().map(String::as_str) == Some(VERBATIM) {
            continue;
        }
        chunks.push(chunk);
    }
    if chunks.is_empty() {
        return Err(TernError::InvalidArgument(format!(
            "key expression `{s}`: empty"
        )));
    }
    // `**/*` and `*/**` are the same set; order `*` first.
    let mut i = 0;
    while i + 1 < chunks.len() {
        if chunks[i] == VERBATIM && chunks[i + 1] == SINGLE {
            chunks.swap(i, i + 1);
            i = i.saturating_sub(1);
        } else {
            i += 1;
        }
    }
    // The swap can create a new adjacent `**` pair.
    chunks.dedup_by(|a, b| a.as_str() == VERBATIM && b.as_str() == VERBATIM);
    Ok(chunks.join("/"))
}

fn validate_chunk(chunk: &str) -> Result<(), &'static str> {
    if chunk == SINGLE || chunk == VERBATIM {
        return Ok(());
    }
    let bytes = chunk.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => {
                if bytes.get(i + 1) != Some(&b'*') {
                    return Err("`$` must be followed by `*`");
                }
                i += 2;
            }
            b'*' => return Err("`*` must stand alone in its chunk"),
            b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'@' => i += 1,
            _ => return Err("invalid character"),
        }
    }
    Ok(())
}

/// `$*$*` folds to `$*`; a chunk that is nothing but `$*` is the same set
/// as `*`.
fn fold_substring_runs(chunk: &str) -> String {
    let mut out = String::with_capacity(chunk.len());
    let bytes = chunk.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(SUBSTRING) {
            if !out.ends_with("$*") {
                out.push_str("$*");
            }
            i += 2;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    if out == "$*" {
        return SINGLE.to_string();
    }
    out
}

fn chunks_of(s: &str) -> SmallVec<[&str; 8]> {
    s.split('/').collect()
}

/// Do `a` and `b` share at least one concrete key? Symmetric.
pub fn intersects(a: &str, b: &str) -> bool {
    inter_chunks(&chunks_of(a), &chunks_of(b))
}

/// Does every concrete key matched by `b` also match `a`?
pub fn includes(a: &str, b: &str) -> bool {
    incl_chunks(&chunks_of(a), &chunks_of(b))
}

fn inter_chunks(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&VERBATIM), _) => {
            inter_chunks(&a[1..], b) || (!b.is_empty() && inter_chunks(a, &b[1..]))
        }
        (_, Some(&VERBATIM)) => {
            inter_chunks(a, &b[1..]) || (!a.is_empty() && inter_chunks(&a[1..], b))
        }
        (None, _) | (_, None) => false,
        (Some(ca), Some(cb)) => chunk_inter(ca, cb) && inter_chunks(&a[1..], &b[1..]),
    }
}

fn incl_chunks(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&VERBATIM), _) => {
            incl_chunks(&a[1..], b) || (!b.is_empty() && incl_chunks(a, &b[1..]))
        }
        (None, _) | (_, None) => false,
        (Some(ca), Some(cb)) => {
            // Only `**` on the left can cover the unbounded set of `**`.
            if *cb == VERBATIM {
                return false;
            }
            chunk_incl(ca, cb) && incl_chunks(&a[1..], &b[1..])
        }
    }
}

fn chunk_inter(a: &str, b: &str) -> bool {
    if a == b || a == SINGLE || b == SINGLE {
        return true;
    }
    seg_inter(a.as_bytes(), b.as_bytes())
}

fn chunk_incl(a: &str, b: &str) -> bool {
    if a == b || a == SINGLE {
        return true;
    }
    if b == SINGLE {
        return false;
    }
    seg_incl(a.as_bytes(), b.as_bytes())
}

/// One token of a chunk pattern: a literal byte or the `$*` wildcard.
fn tok(p: &[u8]) -> (bool, &[u8]) {
    if p.starts_with(SUBSTRING) {
        (true, &p[2..])
    } else {
        (false, &p[1..])
    }
}

/// Within-chunk intersection with backtracking over `$*` on either side.
fn seg_inter(a: &[u8], b: &[u8]) -> bool {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return true,
        (true, false) => return b.starts_with(SUBSTRING) && seg_inter(a, tok(b).1),
        (false, true) => return a.starts_with(SUBSTRING) && seg_inter(tok(a).1, b),
        (false, false) => {}
    }
    let (a_star, a_rest) = tok(a);
    let (b_star, b_rest) = tok(b);
    if a_star {
        return seg_inter(a_rest, b) || seg_inter(a, b_rest);
    }
    if b_star {
        return seg_inter(a, b_rest) || seg_inter(a_rest, b);
    }
    a[0] == b[0] && seg_inter(a_rest, b_rest)
}

/// Within-chunk inclusion: a literal on the left consumes only an equal
/// literal; `$*` on the left absorbs anything, including `$*` tokens of
/// the right.
fn seg_incl(a: &[u8], b: &[u8]) -> bool {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return true,
        (true, false) => return false,
        (false, true) => return a.starts_with(SUBSTRING) && seg_incl(tok(a).1, b),
        (false, false) => {}
    }
    let (a_star, a_rest) = tok(a);
    if a_star {
        return seg_incl(a_rest, b) || seg_incl(a, tok(b).1);
    }
    let (b_star, b_rest) = tok(b);
    if b_star {
        return false;
    }
    a[0] == b[0] && seg_incl(a_rest, b_rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        assert_eq!(canonicalize("Demo//Example/").unwrap(), "demo/example");
        assert_eq!(canonicalize("a/**/**/b").unwrap(), "a/**/b");
        assert_eq!(canonicalize("a/**/*").unwrap(), "a/*/**");
        assert_eq!(canonicalize("a$*$*b").unwrap(), "a$*b");
        assert_eq!(canonicalize("$*").unwrap(), "*");
        assert!(canonicalize("").is_err());
        assert!(canonicalize("a/b c").is_err());
        assert!(canonicalize("ab*cd").is_err());
        assert!(canonicalize("a$b").is_err());
    }
}
