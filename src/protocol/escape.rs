//! Escaping for payloads embedded in a remote string literal
//!
//! All escaping goes through [`escape_lua`]. Its output is plain ASCII
//! made of units that are either one printable character, a two byte
//! escape (`\\`, `\"`, `\n`, ...) or a four byte decimal escape (`\ddd`).
//! Chunking only ever cuts between units.

use std::fmt::Write as _;

/// Escape arbitrary bytes for use inside a double quoted script string.
pub fn escape_lua(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 4);
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'[' | b']' => decimal(&mut out, byte),
            0x20..=0x7e => out.push(byte as char),
            _ => decimal(&mut out, byte),
        }
    }
    out
}

fn decimal(out: &mut String, byte: u8) {
    // Always three digits so a following digit can't extend the escape.
    let _ = write!(out, "\\{:03}", byte);
}

/// Length of the escape unit starting at `at`.
pub fn unit_len(escaped: &[u8], at: usize) -> usize {
    match escaped.get(at) {
        None => 0,
        Some(b'\\') => match escaped.get(at + 1) {
            Some(next) if next.is_ascii_digit() => 4,
            _ => 2,
        },
        Some(_) => 1,
    }
}

/// End of the longest run of whole units starting at `start` that fits in
/// `budget` bytes. Returns `start` when not even one unit fits.
///
/// `start` must itself be a unit boundary.
pub fn safe_chunk_end(escaped: &str, start: usize, budget: usize) -> usize {
    let bytes = escaped.as_bytes();
    let limit = start.saturating_add(budget).min(bytes.len());
    let mut end = start;
    while end < bytes.len() {
        let next = end + unit_len(bytes, end);
        if next > limit {
            break;
        }
        end = next;
    }
    end
}

/// Number of escape units in `escaped`, i.e. the number of raw bytes it
/// encodes.
pub fn unit_count(escaped: &str) -> usize {
    let bytes = escaped.as_bytes();
    let mut at = 0;
    let mut units = 0;
    while at < bytes.len() {
        at += unit_len(bytes, at);
        units += 1;
    }
    units
}

/// Inverse of [`escape_lua`]; also accepts the short escapes the remote
/// interpreter understands. Returns `None` on a malformed escape.
pub fn unescape_lua(escaped: &str) -> Option<Vec<u8>> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let next = *bytes.get(i + 1)?;
        match next {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' | b'"' | b'\'' => out.push(next),
            b'0'..=b'9' => {
                let digits = bytes
                    .get(i + 1..)?
                    .iter()
                    .take(3)
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                let text = std::str::from_utf8(&bytes[i + 1..i + 1 + digits]).ok()?;
                out.push(text.parse::<u8>().ok()?);
                i += 1 + digits;
                continue;
            }
            _ => return None,
        }
        i += 2;
    }
    Some(out)
}
