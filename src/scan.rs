//! Raw-line scanning: timestamp extraction and line-format detection.
//!
//! The buffered source runs every pushed line through [`scan_line`] once, at
//! ingest time. Detection is byte-level and allocation-free for plain lines;
//! JSON lines pay one `serde_json` parse to read their `level`/`timestamp`
//! fields.

use crate::level::{self, LogLevel};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use std::fmt;

/// Wire shape of a line, as exposed through the `Format` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineFormat {
    #[default]
    Plain,
    Json,
    Logfmt,
}

impl fmt::Display for LineFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineFormat::Plain => "plain",
            LineFormat::Json => "json",
            LineFormat::Logfmt => "logfmt",
        };
        write!(f, "{}", name)
    }
}

/// Everything the scanner learned about one raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedLine {
    pub level: LogLevel,
    pub timestamp: Option<NaiveDateTime>,
    pub format: LineFormat,
}

/// Scan a raw line for level, timestamp and format.
pub fn scan_line(line: &str) -> ScannedLine {
    let trimmed = line.trim_start();

    if trimmed.starts_with('{') {
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(trimmed) {
            let level = fields
                .get("level")
                .or_else(|| fields.get("severity"))
                .or_else(|| fields.get("lvl"))
                .and_then(Value::as_str)
                .map(level::parse_level_name)
                .unwrap_or_else(|| level::detect_level(line));
            let timestamp = fields
                .get("timestamp")
                .or_else(|| fields.get("time"))
                .or_else(|| fields.get("ts"))
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
                .or_else(|| parse_timestamp(line));
            return ScannedLine {
                level,
                timestamp,
                format: LineFormat::Json,
            };
        }
    }

    if let Some(scanned) = scan_logfmt(trimmed) {
        return scanned;
    }

    ScannedLine {
        level: level::detect_level(line),
        timestamp: parse_timestamp(line),
        format: LineFormat::Plain,
    }
}

/// Logfmt: `key=value` pairs separated by whitespace. Returns `None` when the
/// line does not look like logfmt at all.
fn scan_logfmt(line: &str) -> Option<ScannedLine> {
    if !looks_like_logfmt(line) {
        return None;
    }

    let mut level = LogLevel::None;
    let mut timestamp = None;
    for token in line.split_ascii_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            let value = value.trim_matches('"');
            match key {
                "level" | "severity" | "lvl" => level = level::parse_level_name(value),
                "ts" | "time" | "timestamp" => timestamp = parse_timestamp(value),
                _ => {}
            }
        }
    }
    if level == LogLevel::None {
        level = level::detect_level(line);
    }
    if timestamp.is_none() {
        timestamp = parse_timestamp(line);
    }
    Some(ScannedLine {
        level,
        timestamp,
        format: LineFormat::Logfmt,
    })
}

/// How many leading whitespace-separated tokens are inspected for a
/// `key=value` pair.
const LOGFMT_TOKEN_LIMIT: usize = 8;

/// Cheap logfmt shape check: one of the first few tokens is a bare
/// `key=value` pair whose key is an identifier.
fn looks_like_logfmt(line: &str) -> bool {
    line.split_ascii_whitespace()
        .take(LOGFMT_TOKEN_LIMIT)
        .any(is_key_value_token)
}

fn is_key_value_token(token: &str) -> bool {
    match token.split_once('=') {
        Some((key, value)) => {
            !key.is_empty()
                && !value.is_empty()
                && key
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.')
        }
        None => false,
    }
}

/// How far into a line a timestamp may begin.
const TIMESTAMP_SCAN_LIMIT: usize = 48;

/// Parse the first timestamp found near the start of a line.
///
/// The prefix is segmented into digit runs; a 4-digit run followed by `-`
/// opens a `YYYY-MM-DD` date with an optional `HH:MM:SS[.frac]` time part
/// (space- or `T`-separated), a 2-digit run followed by `:` opens a bare
/// time anchored to the epoch date. Candidates that fail to parse as real
/// calendar dates or times are skipped and the scan continues.
pub fn parse_timestamp(line: &str) -> Option<NaiveDateTime> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len().min(TIMESTAMP_SCAN_LIMIT) {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }

        match i - run_start {
            4 if bytes.get(i) == Some(&b'-') => {
                if let Some(timestamp) = parse_date_time(bytes, run_start) {
                    return Some(timestamp);
                }
            }
            2 if bytes.get(i) == Some(&b':') => {
                if let Some(time) = parse_time(bytes, run_start) {
                    return Some(NaiveDateTime::new(epoch_date(), time));
                }
            }
            _ => {}
        }
    }

    None
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

/// Parse `YYYY-MM-DD` at `start`, then an optional time part.
fn parse_date_time(bytes: &[u8], start: usize) -> Option<NaiveDateTime> {
    let year = read_digits(bytes, start, 4)?;
    if bytes.get(start + 4) != Some(&b'-') {
        return None;
    }
    let month = read_digits(bytes, start + 5, 2)?;
    if bytes.get(start + 7) != Some(&b'-') {
        return None;
    }
    let day = read_digits(bytes, start + 8, 2)?;
    let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;

    let time_start = start + 10;
    let time = match bytes.get(time_start) {
        Some(b' ') | Some(b'T') => parse_time(bytes, time_start + 1),
        _ => None,
    };
    Some(NaiveDateTime::new(
        date,
        time.unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
    ))
}

/// Parse `HH:MM:SS` at `start`, with an optional `.frac` suffix (1-9 digits).
fn parse_time(bytes: &[u8], start: usize) -> Option<NaiveTime> {
    let hour = read_digits(bytes, start, 2)?;
    if bytes.get(start + 2) != Some(&b':') {
        return None;
    }
    let minute = read_digits(bytes, start + 3, 2)?;
    if bytes.get(start + 5) != Some(&b':') {
        return None;
    }
    let second = read_digits(bytes, start + 6, 2)?;

    let mut nanos = 0u32;
    if bytes.get(start + 8) == Some(&b'.') {
        let mut seen = 0;
        let mut value = 0u64;
        while seen < 9 {
            match bytes.get(start + 9 + seen) {
                Some(b) if b.is_ascii_digit() => {
                    value = value * 10 + (b - b'0') as u64;
                    seen += 1;
                }
                _ => break,
            }
        }
        if seen > 0 {
            nanos = (value * 10u64.pow(9 - seen as u32)) as u32;
        }
    }

    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos)
}

fn read_digits(bytes: &[u8], start: usize, count: usize) -> Option<u32> {
    if start + count > bytes.len() {
        return None;
    }
    let mut value = 0u32;
    for &b in &bytes[start..start + count] {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0') as u32;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).expect("timestamp should parse")
    }

    #[test]
    fn parses_full_date_time() {
        assert_eq!(
            ts("2024-03-01 10:20:30 INFO hello"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 20, 30)
                .unwrap()
        );
    }

    #[test]
    fn parses_iso_t_separator_and_fraction() {
        assert_eq!(
            ts("2024-03-01T10:20:30.250 WARN x"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_milli_opt(10, 20, 30, 250)
                .unwrap()
        );
    }

    #[test]
    fn parses_bare_date() {
        assert_eq!(
            ts("2024-12-31 no time here"),
            NaiveDate::from_ymd_opt(2024, 12, 31)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn parses_time_only_anchored_to_epoch() {
        assert_eq!(
            ts("10:00:05 INFO start"),
            NaiveDate::from_ymd_opt(1970, 1, 1)
                .unwrap()
                .and_hms_opt(10, 0, 5)
                .unwrap()
        );
    }

    #[test]
    fn skips_invalid_calendar_dates() {
        assert_eq!(parse_timestamp("2024-13-40 nonsense"), None);
        // a valid time part still anchors when the date is bogus
        assert_eq!(
            parse_timestamp("2024-13-40 10:00:00"),
            Some(
                NaiveDate::from_ymd_opt(1970, 1, 1)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap()
            )
        );
    }

    #[test]
    fn long_digit_runs_are_not_anchors() {
        assert_eq!(parse_timestamp("20240101 103000 req 7"), None);
    }

    #[test]
    fn no_timestamp() {
        assert_eq!(parse_timestamp("    at com.example.Foo.bar"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn anchor_past_limit_is_ignored() {
        let line = format!("{} 2024-01-01 10:00:00", "x".repeat(60));
        assert_eq!(parse_timestamp(&line), None);
    }

    #[test]
    fn scans_plain_line() {
        let scanned = scan_line("2024-01-01 10:00:00 ERROR boom");
        assert_eq!(scanned.format, LineFormat::Plain);
        assert_eq!(scanned.level, LogLevel::Error);
        assert!(scanned.timestamp.is_some());
    }

    #[test]
    fn scans_json_line() {
        let scanned =
            scan_line(r#"{"level":"error","timestamp":"2024-01-01 10:00:00","msg":"boom"}"#);
        assert_eq!(scanned.format, LineFormat::Json);
        assert_eq!(scanned.level, LogLevel::Error);
        assert_eq!(
            scanned.timestamp,
            Some(
                NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap()
            )
        );
    }

    #[test]
    fn json_level_field_beats_keyword_scan() {
        // message text says ERROR but the level field is info
        let scanned = scan_line(r#"{"level":"info","msg":"ERROR in message text"}"#);
        assert_eq!(scanned.level, LogLevel::Info);
    }

    #[test]
    fn invalid_json_falls_back_to_plain() {
        let scanned = scan_line("{not json at all");
        assert_eq!(scanned.format, LineFormat::Plain);
    }

    #[test]
    fn scans_logfmt_line() {
        let scanned = scan_line(r#"level=warn msg="slow query" service=db"#);
        assert_eq!(scanned.format, LineFormat::Logfmt);
        assert_eq!(scanned.level, LogLevel::Warning);
    }

    #[test]
    fn logfmt_requires_key_value_shape() {
        // '=' in prose is not logfmt
        assert_eq!(scan_line("x == y failed").format, LineFormat::Plain);
        // keys must be identifiers
        assert_eq!(scan_line("--flag=value given").format, LineFormat::Plain);
    }

    #[test]
    fn logfmt_pair_past_token_limit_is_ignored() {
        let line = format!("{} key=value", "word ".repeat(LOGFMT_TOKEN_LIMIT));
        assert_eq!(scan_line(&line).format, LineFormat::Plain);
    }
}
