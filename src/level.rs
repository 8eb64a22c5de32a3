//! Log levels and keyword detection over raw line content.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity attached to a log line.
///
/// `None` means the line carries no level marker at all (a continuation line
/// of a stack trace, for instance). `Other` is reserved for sources whose
/// lines carry an explicit but unrecognized marker; keyword detection never
/// produces it.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LogLevel {
    #[default]
    None,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Other,
}

impl LogLevel {
    /// Whether a line with this level opens a new logical entry.
    /// Lines with no usable level (`None`, `Other`) continue the previous one.
    pub fn starts_entry(self) -> bool {
        !matches!(self, LogLevel::None | LogLevel::Other)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::None => "none",
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Words starting past this offset are not considered. Levels live near the
/// front of a line; scanning further produces false positives from message
/// text.
const LEVEL_SCAN_LIMIT: usize = 80;

/// Detect the level of a raw line from the first severity keyword in it.
///
/// The line's prefix is segmented into maximal alphabetic words (ANSI escape
/// sequences are stepped over, so colored output still matches) and each
/// word is compared case-insensitively against the known level names. A
/// word must equal a name exactly: `terror` and `informational` stay
/// undetected.
pub fn detect_level(line: &str) -> LogLevel {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len().min(LEVEL_SCAN_LIMIT) {
        let b = bytes[i];
        if b == 0x1B {
            i = skip_ansi(bytes, i);
            continue;
        }
        if !b.is_ascii_alphabetic() {
            i += 1;
            continue;
        }
        let word_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        if let Some(level) = level_for_word(&bytes[word_start..i]) {
            return level;
        }
    }
    LogLevel::None
}

/// The level a single word names, if any.
fn level_for_word(word: &[u8]) -> Option<LogLevel> {
    let level = if word.eq_ignore_ascii_case(b"fatal") {
        LogLevel::Fatal
    } else if word.eq_ignore_ascii_case(b"error") {
        LogLevel::Error
    } else if word.eq_ignore_ascii_case(b"warn") || word.eq_ignore_ascii_case(b"warning") {
        LogLevel::Warning
    } else if word.eq_ignore_ascii_case(b"info") {
        LogLevel::Info
    } else if word.eq_ignore_ascii_case(b"debug") {
        LogLevel::Debug
    } else if word.eq_ignore_ascii_case(b"trace") {
        LogLevel::Trace
    } else {
        return None;
    };
    Some(level)
}

/// Index just past the ANSI escape sequence starting at `start`. Consumes
/// the CSI parameter bytes and the final byte; a bare ESC advances by one.
fn skip_ansi(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    if bytes.get(i) == Some(&b'[') {
        i += 1;
        while let Some(b) = bytes.get(i) {
            i += 1;
            if (0x40..=0x7E).contains(b) {
                break;
            }
        }
    }
    i
}

/// Parse an explicit level name, as found in structured (JSON/logfmt) lines.
/// Unrecognized non-empty names map to `Other`.
pub fn parse_level_name(name: &str) -> LogLevel {
    let name = name.trim();
    if name.is_empty() {
        return LogLevel::None;
    }
    if let Some(level) = level_for_word(name.as_bytes()) {
        return level;
    }
    if name.eq_ignore_ascii_case("err") {
        LogLevel::Error
    } else if name.eq_ignore_ascii_case("critical") {
        LogLevel::Fatal
    } else {
        LogLevel::Other
    }
}
