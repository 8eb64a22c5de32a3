use super::{LineFilter, LogLine};
use crate::level::LogLevel;

/// Passes lines whose level is at least a minimum severity. Lines without a
/// usable level (`None`, `Other`) never pass.
pub struct LevelFilter {
    minimum: LogLevel,
}

impl LevelFilter {
    pub fn at_least(minimum: LogLevel) -> Self {
        Self { minimum }
    }
}

impl LineFilter for LevelFilter {
    fn matches(&self, line: &LogLine) -> bool {
        line.level.starts_entry() && line.level >= self.minimum
    }
}
