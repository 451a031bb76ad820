//! Best-effort timestamp extraction from log line prefixes.
//!
//! Two entry points exist because the two sources differ:
//!
//! - [`split_line_timestamp`] recognizes the formats application loggers
//!   write at the start of a file line.
//! - [`split_container_timestamp`] handles the runtime-injected RFC3339
//!   prefix of container log payloads.
//!
//! Both strip the recognized prefix and one separator from the message.
//!
//! Neither function fails. `None` tells the caller to use the ingestion time.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Zone-less prefixes tried after RFC3339, in order. Interpreted as UTC.
///
/// The first format whose fixed-width prefix parses wins, so wider
/// fractional forms come before the whole-second ones.
const NAIVE_PREFIX_FORMATS: &[(&str, usize)] = &[
    ("%Y-%m-%d %H:%M:%S%.6f", 26),
    ("%Y-%m-%dT%H:%M:%S%.6f", 26),
    ("%Y-%m-%d %H:%M:%S%.3f", 23),
    ("%Y-%m-%dT%H:%M:%S%.3f", 23),
    ("%Y-%m-%d %H:%M:%S", 19),
    ("%Y-%m-%dT%H:%M:%S", 19),
];

/// Formats accepted inside a `[...]` prefix, as written by common app loggers.
const BRACKETED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Widths of `Z`-terminated RFC3339 prefixes with 0, 6 and 9 fraction digits.
const CONTAINER_PREFIX_WIDTHS: &[usize] = &[20, 27, 30];

/// Split a file line into its leading timestamp and the message.
///
/// Tries RFC3339 (any fraction precision, any offset) on the leading
/// whitespace-delimited token, then the fixed-width zone-less formats,
/// then a bracketed `[YYYY-MM-DD HH:MM:SS]` prefix. Without a match the
/// whole line is the message.
pub fn split_line_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    match line_timestamp_prefix(line) {
        Some((ts, width)) => (Some(ts), skip_separator(&line[width..])),
        None => (None, line),
    }
}

/// Timestamp at the start of `line` and the byte width it occupies.
fn line_timestamp_prefix(line: &str) -> Option<(DateTime<Utc>, usize)> {
    let token = leading_token(line);
    if let Some(ts) = parse_rfc3339(token) {
        return Some((ts, token.len()));
    }

    for (format, width) in NAIVE_PREFIX_FORMATS {
        if let Some(prefix) = line.get(..*width) {
            if let Ok(naive) = NaiveDateTime::parse_from_str(prefix, format) {
                return Some((naive.and_utc(), *width));
            }
        }
    }

    parse_bracketed(line)
}

/// Split a container payload into its leading timestamp and the message.
///
/// The byte after the timestamp is a separator and is dropped. Trailing
/// line terminators are removed from the message either way. When no
/// timestamp is found the whole payload is the message.
pub fn split_container_timestamp(payload: &str) -> (Option<DateTime<Utc>>, &str) {
    for width in CONTAINER_PREFIX_WIDTHS {
        if let Some(ts) = payload.get(..*width).and_then(parse_rfc3339) {
            return (Some(ts), trim_line_ending(skip_separator(&payload[*width..])));
        }
    }

    // Runtimes trim trailing zeros from the fraction, so fall back to the token.
    let token = leading_token(payload);
    if let Some(ts) = parse_rfc3339(token) {
        return (Some(ts), trim_line_ending(skip_separator(&payload[token.len()..])));
    }

    (None, trim_line_ending(payload))
}

/// Remove one trailing `\n` and an optional `\r` before it.
pub fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn parse_rfc3339(candidate: &str) -> Option<DateTime<Utc>> {
    if candidate.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(candidate)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_bracketed(line: &str) -> Option<(DateTime<Utc>, usize)> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find(']')?;
    let inner = &rest[..end];

    BRACKETED_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(inner, format)
            .ok()
            .map(|naive| (naive.and_utc(), end + 2))
    })
}

fn leading_token(text: &str) -> &str {
    let end = text
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(text.len());
    &text[..end]
}

fn skip_separator(rest: &str) -> &str {
    match rest.as_bytes().first() {
        Some(b' ') | Some(b'\t') => &rest[1..],
        _ => rest,
    }
}
