//! Line- and entry-level predicates for the filtering stage.

pub mod level_filter;
pub mod regex_filter;
pub mod string_filter;

pub use level_filter::LevelFilter;
pub use regex_filter::RegexFilter;
pub use string_filter::SubstringFilter;

use crate::index::{LogEntryIndex, LogLineIndex};
use crate::level::LogLevel;
use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A captured source row, as handed to filters and staged by the filtering
/// stage while it collects the lines of one logical entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Row index within the filtered stage's source.
    pub index: LogLineIndex,
    /// Row index within the ultimate raw source.
    pub original_index: LogLineIndex,
    /// The logical entry the row belongs to, per the source.
    pub entry: LogEntryIndex,
    pub content: String,
    pub level: LogLevel,
    pub timestamp: Option<NaiveDateTime>,
}

/// Decides per physical line.
pub trait LineFilter: Send + Sync {
    fn matches(&self, line: &LogLine) -> bool;
}

/// Decides over the collected lines of one logical entry.
pub trait EntryFilter: Send + Sync {
    fn matches_entry(&self, lines: &[LogLine]) -> bool;
}

/// Accepts everything, at both levels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFilter;

impl LineFilter for NoFilter {
    fn matches(&self, _line: &LogLine) -> bool {
        true
    }
}

impl EntryFilter for NoFilter {
    fn matches_entry(&self, _lines: &[LogLine]) -> bool {
        true
    }
}

/// Conjunction of line filters.
pub struct AndFilter {
    filters: Vec<Arc<dyn LineFilter>>,
}

impl AndFilter {
    pub fn new(filters: Vec<Arc<dyn LineFilter>>) -> Self {
        AndFilter { filters }
    }
}

impl LineFilter for AndFilter {
    fn matches(&self, line: &LogLine) -> bool {
        self.filters.iter().all(|f| f.matches(line))
    }
}

/// Lifts a line filter to entry level: the entry passes when any of its
/// lines matches.
pub struct AnyLineFilter {
    inner: Arc<dyn LineFilter>,
}

impl AnyLineFilter {
    pub fn new(inner: Arc<dyn LineFilter>) -> Self {
        AnyLineFilter { inner }
    }
}

impl EntryFilter for AnyLineFilter {
    fn matches_entry(&self, lines: &[LogLine]) -> bool {
        lines.iter().any(|line| self.inner.matches(line))
    }
}

/// How a pattern is interpreted when building a line filter. Deserializable
/// so embedders can keep it in their settings next to the pattern itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    Plain { case_sensitive: bool },
    Regex { case_sensitive: bool },
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::Plain {
            case_sensitive: false,
        }
    }
}

impl FilterMode {
    /// Plain text matching, case-insensitive by default.
    pub fn plain() -> Self {
        FilterMode::default()
    }

    /// Regex matching, case-insensitive by default.
    pub fn regex() -> Self {
        FilterMode::Regex {
            case_sensitive: false,
        }
    }

    /// Build a line filter from a pattern in this mode.
    pub fn build(&self, pattern: &str) -> anyhow::Result<Arc<dyn LineFilter>> {
        match *self {
            FilterMode::Plain { case_sensitive } => {
                Ok(Arc::new(SubstringFilter::new(pattern, case_sensitive)))
            }
            FilterMode::Regex { case_sensitive } => {
                let filter = RegexFilter::new(pattern, case_sensitive)
                    .with_context(|| format!("invalid filter pattern: {}", pattern))?;
                Ok(Arc::new(filter))
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_line(index: usize, content: &str, level: LogLevel) -> LogLine {
    LogLine {
        index: LogLineIndex::new(index),
        original_index: LogLineIndex::new(index),
        entry: LogEntryIndex::new(index),
        content: content.to_string(),
        level,
        timestamp: None,
    }
}
