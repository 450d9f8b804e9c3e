//! Best-effort extraction of a string field from a partially received JSON
//! argument buffer.
//!
//! While tool-call arguments stream in, the buffer is usually not valid JSON
//! yet (`{"sql":"SELECT co`). A strict parse is tried first; the fallback
//! locates the field with a regex and walks the (possibly unterminated)
//! string value, unescaping as it goes.

use std::sync::LazyLock;

use regex::Regex;

// The two argument fields tool drafts carry; compiled once, not per delta.
static SQL_FIELD: LazyLock<Option<Regex>> = LazyLock::new(|| field_pattern("sql"));
static CODE_FIELD: LazyLock<Option<Regex>> = LazyLock::new(|| field_pattern("code"));

fn field_pattern(field: &str) -> Option<Regex> {
    Regex::new(&format!(r#""{}"\s*:\s*""#, regex::escape(field))).ok()
}

/// Extract `field`'s string value from a complete or partial JSON buffer.
pub fn extract_code_field(raw: &str, field: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        return value.get(field).and_then(|v| v.as_str()).map(String::from);
    }
    extract_partial(raw, field)
}

/// Finalize from a fully accumulated buffer. Strict parse of the completed
/// arguments, falling back to the partial extractor for servers that close a
/// stream mid-object.
pub fn finalize_code(raw: &str, field: &str) -> String {
    extract_code_field(raw, field).unwrap_or_default()
}

fn extract_partial(raw: &str, field: &str) -> Option<String> {
    let m = match field {
        "sql" => SQL_FIELD.as_ref()?.find(raw),
        "code" => CODE_FIELD.as_ref()?.find(raw),
        other => field_pattern(other)?.find(raw),
    }?;
    Some(unescape_partial(&raw[m.end()..]))
}

/// Unescape a JSON string body that may be cut off anywhere, including in the
/// middle of an escape sequence. Stops at the first unescaped quote.
fn unescape_partial(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('/') => out.push('/'),
                Some('b') => out.push('\u{0008}'),
                Some('f') => out.push('\u{000C}'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() == 4 {
                        if let Some(ch) =
                            u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
                        {
                            out.push(ch);
                        }
                    }
                    // Incomplete \uXX at the buffer edge: dropped.
                }
                // Trailing lone backslash at the buffer edge: dropped.
                Some(other) => out.push(other),
                None => {}
            },
            _ => out.push(c),
        }
    }
    out
}
