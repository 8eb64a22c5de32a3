//! Row identity: physical line indices and logical entry indices.
//!
//! Both carry a `-1` sentinel for "no such row". The sentinel propagates
//! through column translations instead of raising errors, so a stale query
//! against a shrunk source degrades to default values.

use std::fmt;

/// Index of a physical line within a log source. `INVALID` marks a line that
/// does not (or no longer does) exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogLineIndex(i64);

impl LogLineIndex {
    pub const INVALID: LogLineIndex = LogLineIndex(-1);

    pub fn new(value: usize) -> Self {
        LogLineIndex(value as i64)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The line position, or `None` for the sentinel.
    pub fn value(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }
}

impl Default for LogLineIndex {
    fn default() -> Self {
        LogLineIndex::INVALID
    }
}

impl From<usize> for LogLineIndex {
    fn from(value: usize) -> Self {
        LogLineIndex::new(value)
    }
}

impl fmt::Display for LogLineIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// Index of a logical (possibly multi-line) entry within a log source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogEntryIndex(i64);

impl LogEntryIndex {
    pub const INVALID: LogEntryIndex = LogEntryIndex(-1);

    pub fn new(value: usize) -> Self {
        LogEntryIndex(value as i64)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub fn value(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// The next entry index. `INVALID.next()` is entry 0, so the very first
    /// start line opens entry 0 rather than 1.
    pub fn next(self) -> LogEntryIndex {
        LogEntryIndex(self.0 + 1)
    }
}

impl Default for LogEntryIndex {
    fn default() -> Self {
        LogEntryIndex::INVALID
    }
}

impl From<usize> for LogEntryIndex {
    fn from(value: usize) -> Self {
        LogEntryIndex::new(value)
    }
}

impl fmt::Display for LogEntryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "entry {}", self.0)
        } else {
            write!(f, "entry invalid")
        }
    }
}
